use ring::hmac;

/// HMAC-SHA256
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let tag = hmac::sign(&key, data);

    let mut out = [0u8; 32];
    out.copy_from_slice(tag.as_ref());
    out
}

/// HKDF-SHA256 (RFC 5869) 提取与扩展
pub fn hkdf(input: &[u8], salt: &[u8], info: &[u8], output_len: usize) -> Vec<u8> {
    // 提取
    let prk = hmac_sha256(salt, input);
    let prk = hmac::Key::new(hmac::HMAC_SHA256, &prk);

    // 扩展
    let mut output = Vec::with_capacity(output_len);
    let mut previous: Vec<u8> = Vec::new();
    let mut counter = 1u8;

    while output.len() < output_len {
        let mut ctx = hmac::Context::with_key(&prk);
        ctx.update(&previous);
        ctx.update(info);
        ctx.update(&[counter]);
        previous = ctx.sign().as_ref().to_vec();

        output.extend_from_slice(&previous);
        counter = counter.wrapping_add(1);
    }

    output.truncate(output_len);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_rfc5869_case_1() {
        let ikm = [0x0bu8; 22];
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();

        let okm = hkdf(&ikm, &salt, &info, 42);

        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn test_hkdf_output_length() {
        assert_eq!(hkdf(b"input", b"salt", b"info", 80).len(), 80);
        assert_eq!(hkdf(b"input", b"salt", b"info", 12).len(), 12);
    }
}
