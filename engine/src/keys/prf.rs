//! The TLS1-style pseudo-random function used for key expansion: the secret
//! is split in half and expanded with HMAC-MD5 and HMAC-SHA1 in parallel,
//! the two streams XORed together.

use hmac::{digest::KeyInit, Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use zeroize::Zeroizing;

/// `P_hash` expansion: chained HMACs over an evolving seed.
fn p_hash<M: Mac + KeyInit>(secret: &[u8], seed: &[u8], out: &mut [u8]) {
    let new_mac = || <M as Mac>::new_from_slice(secret).expect("hmac accepts any key");

    // A(1) = HMAC(secret, seed); block(i) = HMAC(secret, A(i) || seed).
    let mut mac = new_mac();
    mac.update(seed);
    let mut chain = mac.finalize().into_bytes();

    let mut written = 0;
    while written < out.len() {
        let mut mac = new_mac();
        mac.update(&chain);
        mac.update(seed);
        let block = mac.finalize().into_bytes();
        let take = block.len().min(out.len() - written);
        out[written..written + take].copy_from_slice(&block[..take]);
        written += take;

        let mut mac = new_mac();
        mac.update(&chain);
        chain = mac.finalize().into_bytes();
    }
}

/// PRF(secret, label, seed): P_MD5 over the first half of the secret XOR
/// P_SHA1 over the second half, both seeded with label ‖ seed.
pub fn tls1_prf(secret: &[u8], label: &[u8], seed: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let mut full_seed = Vec::with_capacity(label.len() + seed.len());
    full_seed.extend_from_slice(label);
    full_seed.extend_from_slice(seed);

    let half = (secret.len() + 1) / 2;
    let first = &secret[..half];
    let second = &secret[secret.len() - half..];

    let mut out = Zeroizing::new(vec![0u8; len]);
    let mut sha_stream = Zeroizing::new(vec![0u8; len]);
    p_hash::<Hmac<Md5>>(first, &full_seed, &mut out);
    p_hash::<Hmac<Sha1>>(second, &full_seed, &mut sha_stream);
    for (a, b) in out.iter_mut().zip(sha_stream.iter()) {
        *a ^= b;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = tls1_prf(b"secret", b"label", b"seed", 64);
        let b = tls1_prf(b"secret", b"label", b"seed", 64);
        assert_eq!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn test_inputs_matter() {
        let base = tls1_prf(b"secret", b"label", b"seed", 64);
        assert_ne!(
            base.as_slice(),
            tls1_prf(b"secret2", b"label", b"seed", 64).as_slice()
        );
        assert_ne!(
            base.as_slice(),
            tls1_prf(b"secret", b"label2", b"seed", 64).as_slice()
        );
        assert_ne!(
            base.as_slice(),
            tls1_prf(b"secret", b"label", b"seed2", 64).as_slice()
        );
    }

    #[test]
    fn test_arbitrary_lengths() {
        for len in [1, 16, 20, 21, 48, 256, 500] {
            assert_eq!(tls1_prf(b"s", b"l", b"x", len).len(), len);
        }
        // A longer output extends the shorter one.
        let short = tls1_prf(b"s", b"l", b"x", 40);
        let long = tls1_prf(b"s", b"l", b"x", 80);
        assert_eq!(&long[..40], short.as_slice());
    }

    #[test]
    fn test_label_and_seed_not_interchangeable() {
        // label="ab", seed="c" must differ from label="a", seed="bc" in
        // general use; equality here would mean the halves are not mixed.
        // They concatenate identically by construction, so this documents
        // the caller's duty to keep labels fixed-width or distinct.
        let a = tls1_prf(b"secret", b"ab", b"c", 32);
        let b = tls1_prf(b"secret", b"a", b"bc", 32);
        assert_eq!(a.as_slice(), b.as_slice());
    }
}
