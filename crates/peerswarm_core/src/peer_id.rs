use rand::RngCore;

use crate::hash_id::Id20;

/// The two letters peerswarm puts into its Azureus-style fingerprint.
pub const CLIENT_CODE: [u8; 2] = *b"PS";

/// Return the version of the invoking crate as a tuple
#[macro_export]
macro_rules! crate_version {
    () => {
        (
            env!("CARGO_PKG_VERSION_MAJOR").parse::<u8>().unwrap_or(0),
            env!("CARGO_PKG_VERSION_MINOR").parse::<u8>().unwrap_or(0),
            env!("CARGO_PKG_VERSION_PATCH").parse::<u8>().unwrap_or(0),
            0u8,
        )
    };
}

/// Maps 0..64 to the alphabet used in fingerprints, anything bigger to `-`.
fn version_digit_to_id(d: u8) -> u8 {
    const VERSION_MAP: &[u8; 64] =
        b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz.-";
    VERSION_MAP.get(d as usize).copied().unwrap_or(b'-')
}

/// Generate a peer id in the Azureus format: `-XXabcd-` followed by 12 random bytes,
/// where `XX` is the client code and `abcd` the version digits.
pub fn generate_azureus_style(client: [u8; 2], version: (u8, u8, u8, u8)) -> Id20 {
    let mut peer_id = [0u8; 20];
    peer_id[0] = b'-';
    peer_id[1..3].copy_from_slice(&client);
    peer_id[3] = version_digit_to_id(version.0);
    peer_id[4] = version_digit_to_id(version.1);
    peer_id[5] = version_digit_to_id(version.2);
    peer_id[6] = version_digit_to_id(version.3);
    peer_id[7] = b'-';
    rand::rng().fill_bytes(&mut peer_id[8..]);
    Id20::new(peer_id)
}

/// A fresh local peer id for this process.
pub fn generate_peer_id() -> Id20 {
    generate_azureus_style(CLIENT_CODE, crate_version!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_azureus_peer_id_generation() {
        for (client, version, correct_fingerprint) in [
            (*b"xx", (1, 2, 3, 4), *b"-xx1234-"),
            (*b"00", (10, 0, 0, 0), *b"-00A000-"),
            (*b"PS", (36, 37, 62, 200), *b"-PSab.--"),
        ] {
            let id1 = generate_azureus_style(client, version);
            let id2 = generate_azureus_style(client, version);
            assert_ne!(id1, id2);
            assert_eq!(id1.0[..8], correct_fingerprint);
            assert_eq!(id2.0[..8], correct_fingerprint);
        }
    }

    #[test]
    fn test_generate_peer_id_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id.0[..3], b"-PS");
        assert_eq!(id.0[7], b'-');
    }
}
