use crate::protocol::sender_key::{SenderKeyMessage, SenderKeyState, SenderMessageKey, MAX_FORWARD_JUMPS};
use crate::protocol::{ProtocolAddress, SenderKeyDistributionMessage, SenderKeyError, SenderKeyRecord, SenderKeyStore};
use chacha20poly1305::aead::{Aead, NewAead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use log::debug;
use uuid::Uuid;

/// 为自己的出站链生成分发消息，必要时先创建出站链
pub fn create_sender_key_distribution_message<S: SenderKeyStore>(
    store: &mut S,
    sender: &ProtocolAddress,
    distribution_id: Uuid,
) -> Result<SenderKeyDistributionMessage, SenderKeyError> {
    if let Some(record) = store.load_sender_key(sender, distribution_id)? {
        if record.state().is_outbound() {
            return Ok(record.state().distribution(distribution_id));
        }
    }

    rotate_sender_key(store, sender, distribution_id)
}

/// 生成新的出站链记录及其分发消息，不写入存储
pub fn new_sender_key_record(
    distribution_id: Uuid,
) -> Result<(SenderKeyRecord, SenderKeyDistributionMessage), SenderKeyError> {
    let state = SenderKeyState::new_outbound()?;
    let message = state.distribution(distribution_id);
    Ok((SenderKeyRecord::new(state), message))
}

/// 无条件创建新的出站链，替换旧记录
pub fn rotate_sender_key<S: SenderKeyStore>(
    store: &mut S,
    sender: &ProtocolAddress,
    distribution_id: Uuid,
) -> Result<SenderKeyDistributionMessage, SenderKeyError> {
    let (record, message) = new_sender_key_record(distribution_id)?;

    debug!(
        "Created outbound chain {} for {} in distribution {}",
        message.chain_id(),
        sender,
        distribution_id
    );

    store.store_sender_key(sender, distribution_id, &record)?;
    Ok(message)
}

/// 处理对方的分发消息：整体替换该发送者的入站记录
pub fn process_sender_key_distribution_message<S: SenderKeyStore>(
    store: &mut S,
    sender: &ProtocolAddress,
    message: &SenderKeyDistributionMessage,
) -> Result<(), SenderKeyError> {
    let record = SenderKeyRecord::new(SenderKeyState::from_distribution(message));

    debug!(
        "Processing distribution from {} (chain {}, iteration {})",
        sender,
        message.chain_id(),
        message.iteration()
    );

    store.store_sender_key(sender, message.distribution_id(), &record)
}

/// 绑定到 (地址, 分发ID) 的群组加解密器
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupCipher {
    address: ProtocolAddress,
    distribution_id: Uuid,
}

impl GroupCipher {
    pub fn new(address: ProtocolAddress, distribution_id: Uuid) -> Self {
        Self {
            address,
            distribution_id,
        }
    }

    pub fn address(&self) -> &ProtocolAddress {
        &self.address
    }

    pub fn distribution_id(&self) -> Uuid {
        self.distribution_id
    }

    /// 加密，出站链前进一步
    pub fn encrypt<S: SenderKeyStore>(&self, store: &mut S, plaintext: &[u8]) -> Result<Vec<u8>, SenderKeyError> {
        let mut record = store
            .load_sender_key(&self.address, self.distribution_id)?
            .ok_or_else(|| SenderKeyError::NoSenderKeyState(self.address.to_string()))?;

        let state = record.state_mut();
        let signing_private = *state.signing_private().ok_or(SenderKeyError::NoSigningKey)?;

        let message_key = state.chain_key.message_key();
        let iteration = message_key.iteration;
        let chain_id = state.chain_id();

        let aad = SenderKeyMessage::associated_data(&self.distribution_id, chain_id, iteration);
        let ciphertext = seal_with(&message_key, plaintext, &aad)?;

        let message = SenderKeyMessage::new_signed(
            self.distribution_id,
            chain_id,
            iteration,
            ciphertext,
            &signing_private,
        )?;

        // 链只向前走，旧状态无法再解出新消息
        state.chain_key = state.chain_key.next();
        store.store_sender_key(&self.address, self.distribution_id, &record)?;

        Ok(message.encode())
    }

    /// 解密，成功后才写回推进后的状态
    pub fn decrypt<S: SenderKeyStore>(&self, store: &mut S, bytes: &[u8]) -> Result<Vec<u8>, SenderKeyError> {
        let message = SenderKeyMessage::decode(bytes)?;

        if message.distribution_id != self.distribution_id {
            return Err(SenderKeyError::InvalidMessage(format!(
                "Distribution id mismatch: expected {}, got {}",
                self.distribution_id, message.distribution_id
            )));
        }

        let mut record = store
            .load_sender_key(&self.address, self.distribution_id)?
            .ok_or_else(|| SenderKeyError::NoSenderKeyState(self.address.to_string()))?;

        let state = record.state_mut();
        if state.chain_id() != message.chain_id {
            return Err(SenderKeyError::NoSenderKeyState(format!(
                "{} has no chain {}",
                self.address, message.chain_id
            )));
        }

        message.verify_signature(state.signing_public())?;

        let message_key = sender_message_key(state, message.chain_id, message.iteration)?;
        let aad = SenderKeyMessage::associated_data(&self.distribution_id, message.chain_id, message.iteration);
        let plaintext = open_with(&message_key, &message.ciphertext, &aad)?;

        store.store_sender_key(&self.address, self.distribution_id, &record)?;
        Ok(plaintext)
    }
}

/// 取得指定迭代的消息密钥：旧迭代从缓存取，新迭代向前推进并缓存中间密钥
fn sender_message_key(
    state: &mut SenderKeyState,
    chain_id: u32,
    iteration: u32,
) -> Result<SenderMessageKey, SenderKeyError> {
    let chain = state.chain_key.clone();

    if chain.iteration > iteration {
        return state
            .remove_message_key(iteration)
            .ok_or(SenderKeyError::DuplicateMessage { chain_id, iteration });
    }

    let jump = iteration - chain.iteration;
    if jump > MAX_FORWARD_JUMPS {
        return Err(SenderKeyError::TooFarAhead(jump));
    }

    let mut chain = chain;
    while chain.iteration < iteration {
        state.add_message_key(chain.message_key());
        chain = chain.next();
    }

    state.chain_key = chain.next();
    Ok(chain.message_key())
}

fn seal_with(message_key: &SenderMessageKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, SenderKeyError> {
    let (key, nonce) = message_key.cipher_parts();
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

    cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|e| SenderKeyError::EncryptionFailed(e.to_string()))
}

fn open_with(message_key: &SenderMessageKey, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, SenderKeyError> {
    let (key, nonce) = message_key.cipher_parts();
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
        .map_err(|e| SenderKeyError::DecryptionFailed(e.to_string()))
}
