use log::warn;
use uuid::Uuid;

/// 从空间ID派生分发ID
///
/// 合法的 UUID 空间ID 直接作为分发ID，结果是确定的。
/// 非 UUID 的空间ID 会得到一个随机 UUID：同一空间的两个会话不会得到相同的分发ID。
/// 这是已知的互通性缺陷，保持原样直到产品意图明确。
pub fn derive_distribution_id(space_id: &str) -> Uuid {
    match Uuid::parse_str(space_id) {
        Ok(id) => id,
        Err(e) => {
            warn!(
                "Space id {:?} is not a UUID ({}), falling back to a random distribution id",
                space_id, e
            );
            Uuid::new_v4()
        }
    }
}
