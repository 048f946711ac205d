//! TLS 1.2 PRF (RFC 5246 §5) and the key schedule built on it.

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384};
use tinyvec::ArrayVec;
use zeroize::Zeroizing;

use super::Hash;
use crate::session::MasterSecret;
use crate::types::HashAlgorithm;

/// PRF(secret, label, seed) = P_<hash>(secret, label + seed)
fn prf_tls12(
    secret: &[u8],
    label: &str,
    seed: &[&[u8]],
    output_len: usize,
    hash: HashAlgorithm,
) -> Result<Zeroizing<Vec<u8>>, String> {
    let mut full_seed: ArrayVec<[u8; 128]> = ArrayVec::default();
    full_seed.extend_from_slice(label.as_bytes());
    for part in seed {
        if full_seed.len() + part.len() > full_seed.capacity() {
            return Err("PRF seed too long".to_string());
        }
        full_seed.extend_from_slice(part);
    }

    match hash {
        HashAlgorithm::SHA256 => p_hash::<Hmac<Sha256>>(secret, &full_seed, output_len),
        HashAlgorithm::SHA384 => p_hash::<Hmac<Sha384>>(secret, &full_seed, output_len),
        _ => Err(format!("Unsupported PRF hash for TLS1.2: {:?}", hash)),
    }
}

fn p_hash<M>(secret: &[u8], full_seed: &[u8], output_len: usize) -> Result<Zeroizing<Vec<u8>>, String>
where
    M: Mac + KeyInit + Clone,
{
    let key = <M as Mac>::new_from_slice(secret).map_err(|_| "Invalid HMAC key length")?;
    let mut out = Zeroizing::new(Vec::with_capacity(output_len));

    // A(1) = HMAC_hash(secret, A(0)) where A(0) = seed
    let mut a = key.clone().chain_update(full_seed).finalize().into_bytes();

    while out.len() < output_len {
        // HMAC_hash(secret, A(i) + seed)
        let output = key
            .clone()
            .chain_update(&a)
            .chain_update(full_seed)
            .finalize()
            .into_bytes();

        let remaining = output_len - out.len();
        let to_copy = remaining.min(output.len());
        out.extend_from_slice(&output[..to_copy]);

        // A(i+1) = HMAC_hash(secret, A(i))
        a = key.clone().chain_update(&a).finalize().into_bytes();
    }

    Ok(out)
}

/// Master secret from the premaster secret.
///
/// With `session_hash` the RFC 7627 extended master secret is derived,
/// otherwise the classic one over both randoms.
pub(crate) fn master_secret(
    pre_master_secret: &[u8],
    client_random: &[u8],
    server_random: &[u8],
    session_hash: Option<&[u8]>,
    hash: HashAlgorithm,
) -> Result<MasterSecret, String> {
    let out = match session_hash {
        Some(session_hash) => prf_tls12(
            pre_master_secret,
            "extended master secret",
            &[session_hash],
            48,
            hash,
        )?,
        None => prf_tls12(
            pre_master_secret,
            "master secret",
            &[client_random, server_random],
            48,
            hash,
        )?,
    };
    let mut secret = [0u8; 48];
    secret.copy_from_slice(&out);
    Ok(MasterSecret::new(secret))
}

/// Key material for AEAD suites, in key block order.
pub(crate) struct KeyBlock {
    pub client_write_key: Zeroizing<Vec<u8>>,
    pub server_write_key: Zeroizing<Vec<u8>>,
    pub client_write_iv: [u8; 4],
    pub server_write_iv: [u8; 4],
}

/// key_block = PRF(master_secret, "key expansion", server_random + client_random)
pub(crate) fn key_block(
    master_secret: &MasterSecret,
    client_random: &[u8],
    server_random: &[u8],
    key_len: usize,
    hash: HashAlgorithm,
) -> Result<KeyBlock, String> {
    let block = prf_tls12(
        master_secret.as_bytes(),
        "key expansion",
        &[server_random, client_random],
        2 * key_len + 8,
        hash,
    )?;

    let (client_write_key, rest) = block.split_at(key_len);
    let (server_write_key, rest) = rest.split_at(key_len);
    let mut client_write_iv = [0; 4];
    client_write_iv.copy_from_slice(&rest[..4]);
    let mut server_write_iv = [0; 4];
    server_write_iv.copy_from_slice(&rest[4..8]);

    Ok(KeyBlock {
        client_write_key: Zeroizing::new(client_write_key.to_vec()),
        server_write_key: Zeroizing::new(server_write_key.to_vec()),
        client_write_iv,
        server_write_iv,
    })
}

/// Finished verify_data over the transcript so far.
pub(crate) fn verify_data(
    master_secret: &MasterSecret,
    client: bool,
    transcript: &Hash,
    hash: HashAlgorithm,
) -> Result<[u8; 12], String> {
    let label = if client {
        "client finished"
    } else {
        "server finished"
    };
    let handshake_hash = transcript.clone_and_finalize();
    let out = prf_tls12(master_secret.as_bytes(), label, &[&handshake_hash], 12, hash)?;
    let mut verify_data = [0; 12];
    verify_data.copy_from_slice(&out);
    Ok(verify_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Published TLS 1.2 PRF test vector (SHA-256).
    #[test]
    fn prf_sha256_vector() {
        let secret = [
            0x9b, 0xbe, 0x43, 0x6b, 0xa9, 0x40, 0xf0, 0x17, 0xb1, 0x76, 0x52, 0x84, 0x9a, 0x71,
            0xdb, 0x35,
        ];
        let seed = [
            0xa0, 0xba, 0x9f, 0x93, 0x6c, 0xda, 0x31, 0x18, 0x27, 0xa6, 0xf7, 0x96, 0xff, 0xd5,
            0x19, 0x8c,
        ];
        let out = prf_tls12(&secret, "test label", &[&seed], 16, HashAlgorithm::SHA256).unwrap();
        assert_eq!(
            &out[..],
            &[
                0xe3, 0xf2, 0x29, 0xba, 0x72, 0x7b, 0xe1, 0x7b, 0x8d, 0x12, 0x26, 0x20, 0x55, 0x7c,
                0xd4, 0x53,
            ]
        );
    }

    #[test]
    fn prf_output_is_prefix_stable() {
        let a = prf_tls12(b"k", "label", &[b"seed"], 20, HashAlgorithm::SHA384).unwrap();
        let b = prf_tls12(b"k", "label", &[b"seed"], 100, HashAlgorithm::SHA384).unwrap();
        assert_eq!(&a[..], &b[..20]);
    }

    #[test]
    fn extended_master_secret_differs() {
        let pms = [7u8; 48];
        let classic =
            master_secret(&pms, &[1; 32], &[2; 32], None, HashAlgorithm::SHA256).unwrap();
        let ems = master_secret(
            &pms,
            &[1; 32],
            &[2; 32],
            Some(&[3; 32]),
            HashAlgorithm::SHA256,
        )
        .unwrap();
        assert_ne!(classic.as_bytes(), ems.as_bytes());
    }

    #[test]
    fn key_block_split() {
        let ms = MasterSecret::new([5; 48]);
        let kb = key_block(&ms, &[1; 32], &[2; 32], 16, HashAlgorithm::SHA256).unwrap();
        assert_eq!(kb.client_write_key.len(), 16);
        assert_eq!(kb.server_write_key.len(), 16);
        assert_ne!(kb.client_write_key, kb.server_write_key);
        assert_ne!(kb.client_write_iv, kb.server_write_iv);
    }

    #[test]
    fn verify_data_depends_on_side() {
        let ms = MasterSecret::new([5; 48]);
        let mut transcript = Hash::new(HashAlgorithm::SHA256).unwrap();
        transcript.update(b"messages");
        let c = verify_data(&ms, true, &transcript, HashAlgorithm::SHA256).unwrap();
        let s = verify_data(&ms, false, &transcript, HashAlgorithm::SHA256).unwrap();
        assert_ne!(c, s);
    }
}
