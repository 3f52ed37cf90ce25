use space_keys::identity::{IdentityMaterialManager, MemberKeys};
use space_keys::protocol::DEFAULT_DEVICE_ID;
use space_keys::space::{
    DistributionDecision, EncryptedSpaceSession, SessionError, SessionState, SpaceKeyDistribution,
    SpaceServiceError, SpaceSessionRegistry,
};
use space_keys::storage::{Database, KeyRecordStore, SenderKeyEntity};

const SPACE: &str = "3d5e7f90-1a2b-4c3d-8e4f-5a6b7c8d9e0f";
const OTHER_SPACE: &str = "7c1d2e3f-4a5b-4c6d-9e7f-8a9b0c1d2e3f";

fn member(user: &str) -> MemberKeys {
    IdentityMaterialManager::provision(user, 3).expect("Failed to provision member")
}

fn session(user: &str) -> EncryptedSpaceSession {
    EncryptedSpaceSession::from_member_keys(&member(user), None, SPACE).expect("Failed to create session")
}

fn published(session: &mut EncryptedSpaceSession) -> SpaceKeyDistribution {
    let message = session.outbound_distribution().unwrap();
    SpaceKeyDistribution::new(session.user_id(), message.encode().unwrap())
}

#[test]
fn test_round_trip_including_empty_and_multibyte() {
    let mut alice = session("alice");
    let mut bob = session("bob");

    let report = bob.create_session(&[published(&mut alice)]).unwrap();
    assert_eq!(report.decision_for("alice"), Some(DistributionDecision::New));

    for text in ["", "hello", "我在路上 🚗", "ünïcödé and ascii"] {
        let ciphertext = alice.encrypt_message(text).unwrap();
        assert_eq!(bob.decrypt_message(&ciphertext, "alice").unwrap(), text);
    }
}

#[test]
fn test_redundant_create_session_reuses_cipher() {
    let mut alice = session("alice");
    let mut bob = session("bob");
    let from_alice = published(&mut alice);

    bob.create_session(&[from_alice.clone()]).unwrap();
    let before = bob.inbound_cipher("alice").cloned().unwrap();

    let first = alice.encrypt_message("before").unwrap();
    assert_eq!(bob.decrypt_message(&first, "alice").unwrap(), "before");

    let report = bob.create_session(&[from_alice]).unwrap();
    assert_eq!(report.decision_for("alice"), Some(DistributionDecision::Unchanged));
    assert_eq!(bob.inbound_cipher("alice"), Some(&before));

    // 重复处理没有把链重置回分发时的迭代
    let second = alice.encrypt_message("after").unwrap();
    assert_eq!(bob.decrypt_message(&second, "alice").unwrap(), "after");
    assert!(matches!(
        bob.decrypt_message(&first, "alice"),
        Err(SessionError::DecryptionFailed(_))
    ));
}

#[test]
fn test_changed_distribution_replaces_old_chain() {
    let mut alice = session("alice");
    let mut bob = session("bob");

    bob.create_session(&[published(&mut alice)]).unwrap();
    let under_old_chain = alice.encrypt_message("old chain").unwrap();

    alice.rotate_outbound().unwrap();
    let report = bob.create_session(&[published(&mut alice)]).unwrap();
    assert_eq!(report.decision_for("alice"), Some(DistributionDecision::Replaced));

    assert!(matches!(
        bob.decrypt_message(&under_old_chain, "alice"),
        Err(SessionError::DecryptionFailed(_))
    ));

    let under_new_chain = alice.encrypt_message("new chain").unwrap();
    assert_eq!(bob.decrypt_message(&under_new_chain, "alice").unwrap(), "new chain");
}

#[test]
fn test_no_session_no_decrypt() {
    let mut alice = session("alice");
    let mut bob = session("bob");
    let ciphertext = alice.encrypt_message("who are you").unwrap();

    for input in [ciphertext.as_str(), "", "not base64 at all", "AAAA"] {
        assert!(matches!(
            bob.decrypt_message(input, "alice"),
            Err(SessionError::NoSessionForSender(sender)) if sender == "alice"
        ));
    }

    // 发送者不能解密自己的消息
    assert!(matches!(
        alice.decrypt_message(&ciphertext, "alice"),
        Err(SessionError::NoSessionForSender(_))
    ));
}

#[test]
fn test_partial_failure_tolerance() {
    let mut alice = session("alice");
    let mut carol = session("carol");
    let mut bob = session("bob");

    let mut corrupted = published(&mut session("mallory")).key_distribution_message;
    corrupted.truncate(corrupted.len() / 2);

    let report = bob
        .create_session(&[
            published(&mut alice),
            SpaceKeyDistribution::new("mallory", corrupted),
            published(&mut carol),
        ])
        .unwrap();

    assert_eq!(report.applied.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(
        &report.failed[0],
        (user, SessionError::MalformedDistribution { .. }) if user == "mallory"
    ));

    for sender in [&mut alice, &mut carol] {
        let ciphertext = sender.encrypt_message("present").unwrap();
        let user = sender.user_id().to_string();
        assert_eq!(bob.decrypt_message(&ciphertext, &user).unwrap(), "present");
    }
    assert!(!bob.has_session_for("mallory"));
}

#[test]
fn test_malformed_distribution_keeps_previous_state() {
    let mut alice = session("alice");
    let mut bob = session("bob");
    bob.create_session(&[published(&mut alice)]).unwrap();

    let report = bob
        .create_session(&[SpaceKeyDistribution::new("alice", vec![3, 1, 2])])
        .unwrap();
    assert_eq!(report.failed.len(), 1);

    let ciphertext = alice.encrypt_message("unaffected").unwrap();
    assert_eq!(bob.decrypt_message(&ciphertext, "alice").unwrap(), "unaffected");
}

#[test]
fn test_distribution_id_stable_for_uuid_space() {
    let keys = member("alice");

    let first = EncryptedSpaceSession::from_member_keys(&keys, None, SPACE).unwrap();
    let second = EncryptedSpaceSession::from_member_keys(&keys, None, SPACE).unwrap();

    assert_eq!(first.distribution_id(), second.distribution_id());
    assert_eq!(first.distribution_id().to_string(), SPACE);
}

#[test]
fn test_foreign_space_distribution_rejected() {
    let keys = member("alice");
    let mut alice_elsewhere = EncryptedSpaceSession::from_member_keys(&keys, None, OTHER_SPACE).unwrap();
    let mut alice = EncryptedSpaceSession::from_member_keys(&keys, None, SPACE).unwrap();
    let mut bob = session("bob");

    let report = bob.create_session(&[published(&mut alice_elsewhere)]).unwrap();
    assert!(report.applied.is_empty());
    assert!(matches!(
        &report.failed[0],
        (user, SessionError::MalformedDistribution { .. }) if user == "alice"
    ));
    assert!(!bob.has_session_for("alice"));

    let ciphertext = alice_elsewhere.encrypt_message("wrong room").unwrap();
    assert!(matches!(
        bob.decrypt_message(&ciphertext, "alice"),
        Err(SessionError::NoSessionForSender(_))
    ));

    // 外来分发不影响已建立的会话
    bob.create_session(&[published(&mut alice)]).unwrap();
    let report = bob.create_session(&[published(&mut alice_elsewhere)]).unwrap();
    assert_eq!(report.failed.len(), 1);
    let ciphertext = alice.encrypt_message("right room").unwrap();
    assert_eq!(bob.decrypt_message(&ciphertext, "alice").unwrap(), "right room");
    assert_eq!(
        bob.inbound_cipher("alice").unwrap().distribution_id(),
        bob.distribution_id()
    );
}

#[test]
fn test_non_uuid_space_ids_do_not_interoperate() {
    let mut alice = EncryptedSpaceSession::from_member_keys(&member("alice"), None, "family-space").unwrap();
    let mut bob = EncryptedSpaceSession::from_member_keys(&member("bob"), None, "family-space").unwrap();
    assert_ne!(alice.distribution_id(), bob.distribution_id());

    let report = bob.create_session(&[published(&mut alice)]).unwrap();
    assert_eq!(report.failed.len(), 1);
    assert!(!bob.has_session_for("alice"));
}

#[test]
fn test_closed_session_rejects_calls() {
    let mut alice = session("alice");
    let from_alice = published(&mut alice);
    let ciphertext = alice.encrypt_message("x").unwrap();

    let mut bob = session("bob");
    bob.create_session(&[from_alice.clone()]).unwrap();
    bob.close();

    assert_eq!(bob.state(), SessionState::Closed);
    assert!(matches!(bob.encrypt_message("y"), Err(SessionError::SessionClosed)));
    assert!(matches!(bob.decrypt_message(&ciphertext, "alice"), Err(SessionError::SessionClosed)));
    assert!(matches!(bob.create_session(&[from_alice]), Err(SessionError::SessionClosed)));
}

fn registry(keys: &MemberKeys, db: &Database) -> SpaceSessionRegistry {
    SpaceSessionRegistry::new(keys.clone(), KeyRecordStore::new(db).unwrap()).unwrap()
}

#[tokio::test]
async fn test_registry_persists_outbound_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let alice_keys = member("alice");
    let mut bob = session("bob");

    {
        let db = Database::open(dir.path().join("alice")).unwrap();
        let alice = registry(&alice_keys, &db);

        let distribution = alice.outbound_distribution(SPACE).await.unwrap();
        bob.create_session(&[SpaceKeyDistribution::new("alice", distribution.encode().unwrap())])
            .unwrap();

        let ciphertext = alice.encrypt(SPACE, "before restart").await.unwrap();
        assert_eq!(bob.decrypt_message(&ciphertext, "alice").unwrap(), "before restart");
        db.flush().unwrap();
    }

    let db = Database::open(dir.path().join("alice")).unwrap();
    let alice = registry(&alice_keys, &db);

    // 恢复的出站链继续前进，bob 不需要新的分发
    let ciphertext = alice.encrypt(SPACE, "after restart").await.unwrap();
    assert_eq!(bob.decrypt_message(&ciphertext, "alice").unwrap(), "after restart");
}

#[tokio::test]
async fn test_registry_recovers_from_corrupt_record() {
    let db = Database::open_temporary().unwrap();
    let keys = member("alice");
    let records = KeyRecordStore::new(&db).unwrap();

    let distribution_id = uuid::Uuid::parse_str(SPACE).unwrap();
    records
        .put(&SenderKeyEntity {
            address: "alice".to_string(),
            device_id: DEFAULT_DEVICE_ID,
            distribution_id,
            record: vec![0xde, 0xad],
            created_at: 0,
        })
        .unwrap();

    let alice = registry(&keys, &db);
    alice.encrypt(SPACE, "fresh chain").await.unwrap();

    let stored = records.load_record("alice", DEFAULT_DEVICE_ID, distribution_id).unwrap();
    assert!(stored.unwrap().state().is_outbound());
}

#[tokio::test]
async fn test_registry_lifecycle() {
    let db = Database::open_temporary().unwrap();
    let alice = registry(&member("alice"), &db);

    let session = alice.open_space(SPACE).await.unwrap();
    let again = alice.open_space(SPACE).await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&session, &again));
    assert_eq!(alice.open_spaces().await, vec![SPACE.to_string()]);

    assert!(alice.close_space(SPACE).await);
    assert_eq!(session.lock().await.state(), SessionState::Closed);
    assert!(!alice.close_space(SPACE).await);

    // 关闭后重新打开得到新的会话，记录仍在
    let reopened = alice.open_space(SPACE).await.unwrap();
    assert!(!std::sync::Arc::ptr_eq(&session, &reopened));
    assert_eq!(reopened.lock().await.state(), SessionState::Bootstrapped);

    let purged = alice.leave_space(SPACE).await.unwrap();
    assert_eq!(purged, 1);
    assert!(alice.session(SPACE).await.is_none());
}

#[tokio::test]
async fn test_registry_rejects_invalid_material() {
    let db = Database::open_temporary().unwrap();
    let mut keys = member("alice");
    keys.identity_key_public = None;

    assert!(matches!(
        SpaceSessionRegistry::new(keys, KeyRecordStore::new(&db).unwrap()),
        Err(SpaceServiceError::Session(SessionError::MaterialUnavailable(_)))
    ));
}

#[tokio::test]
async fn test_non_uuid_space_records_purged_after_reopen() {
    let db = Database::open_temporary().unwrap();
    let alice = registry(&member("alice"), &db);

    let mut distribution_ids = Vec::new();
    for _ in 0..3 {
        let session = alice.open_space("family-space").await.unwrap();
        distribution_ids.push(session.lock().await.distribution_id());
        alice.encrypt("family-space", "hello").await.unwrap();
        assert!(alice.close_space("family-space").await);
    }
    assert!(distribution_ids.iter().all(|id| *id == distribution_ids[0]));
    assert_eq!(alice.distribution_id("family-space").await, distribution_ids[0]);

    let purged = alice.leave_space("family-space").await.unwrap();
    assert_eq!(purged, 1);
    assert!(alice.records().list(distribution_ids[0]).unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_rotation_keeps_current_chain() {
    let db = Database::open_temporary().unwrap();
    let alice = registry(&member("alice"), &db);
    let mut bob = session("bob");

    let distribution = alice.outbound_distribution(SPACE).await.unwrap();
    bob.create_session(&[SpaceKeyDistribution::new("alice", distribution.encode().unwrap())])
        .unwrap();
    let distribution_id = alice.distribution_id(SPACE).await;
    let stored_before = alice.records().get("alice", DEFAULT_DEVICE_ID, distribution_id).unwrap().unwrap();

    let result = alice
        .rotate_with(SPACE, |_| -> Result<(), SpaceServiceError> {
            Err(SpaceServiceError::Unavailable("sealing failed".to_string()))
        })
        .await;
    assert!(matches!(result, Err(SpaceServiceError::Unavailable(_))));

    let stored_after = alice.records().get("alice", DEFAULT_DEVICE_ID, distribution_id).unwrap().unwrap();
    assert_eq!(stored_after.record, stored_before.record);
    assert_eq!(
        alice.outbound_distribution(SPACE).await.unwrap().chain_id(),
        distribution.chain_id()
    );

    // 对端仍持有旧链，消息照常可解
    let ciphertext = alice.encrypt(SPACE, "nothing changed").await.unwrap();
    assert_eq!(bob.decrypt_message(&ciphertext, "alice").unwrap(), "nothing changed");

    // 成功的轮换才写入新链
    let (rotated, recipients) = alice.rotate_with(SPACE, |_| Ok(2usize)).await.unwrap();
    assert_eq!(recipients, 2);
    assert_ne!(rotated.chain_id(), distribution.chain_id());
    let persisted = alice.records().load_record("alice", DEFAULT_DEVICE_ID, distribution_id).unwrap().unwrap();
    assert_eq!(persisted.state().chain_id(), rotated.chain_id());
}
