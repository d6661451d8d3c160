//! Resolvable private address (RPA) resolution.
//!
//! An RPA is `hash(24 bits) || prand(24 bits)` with the two most significant
//! bits of `prand` fixed to `0b01`. Resolution recomputes
//! `hash = ah(IRK, prand)` where `ah` is one AES-128 encryption of the
//! zero-padded `prand`, and compares. This runs once per filtered extended
//! advertisement, so the last successful `(prand, hash)` pair is cached to
//! skip the AES block for advertisers that keep their RPA for a while (they
//! rotate on the order of minutes).

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

/// RPA resolver holding one Identity Resolving Key.
pub struct RpaResolver {
    cipher: Aes128,
    last: Option<(u32, u32)>, // (prand, hash)
}

impl RpaResolver {
    /// Creates a resolver for the given IRK.
    pub fn new(irk: &[u8; 16]) -> Self {
        RpaResolver {
            cipher: Aes128::new(GenericArray::from_slice(irk)),
            last: None,
        }
    }

    /// The `ah` random address hash function: AES-128 of the zero-padded
    /// 24-bit `prand`, truncated to the 24 least significant bits.
    fn ah(&self, prand: u32) -> u32 {
        let mut block = GenericArray::clone_from_slice(&[0u8; 16]);
        block[..3].copy_from_slice(&prand.to_le_bytes()[..3]);
        self.cipher.encrypt_block(&mut block);
        u32::from_le_bytes([block[0], block[1], block[2], 0])
    }

    /// Returns whether `addr` (over-the-air byte order, LSB first) is an
    /// RPA generated from this resolver's IRK.
    pub fn matches(&mut self, addr: &[u8; 6]) -> bool {
        // must be a resolvable private address
        if addr[5] & 0xC0 != 0x40 {
            return false;
        }

        let hash = u32::from_le_bytes([addr[0], addr[1], addr[2], 0]);
        let prand = u32::from_le_bytes([addr[3], addr[4], addr[5], 0]);

        if self.last == Some((prand, hash)) {
            return true;
        }

        let valid = hash == self.ah(prand);
        if valid {
            self.last = Some((prand, hash));
        }
        valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IRK: [u8; 16] = [
        0xEC, 0x02, 0x34, 0xA3, 0x57, 0xC8, 0xAD, 0x05, 0x34, 0x10, 0x10, 0xA6, 0x0A, 0x39, 0x7D,
        0x9B,
    ];

    fn rpa_for(resolver: &RpaResolver, prand: u32) -> [u8; 6] {
        let hash = resolver.ah(prand).to_le_bytes();
        let pr = prand.to_le_bytes();
        [hash[0], hash[1], hash[2], pr[0], pr[1], pr[2]]
    }

    #[test]
    fn resolves_own_rpa() {
        let mut resolver = RpaResolver::new(&IRK);
        // top bits 0b01 mark a resolvable private address
        let addr = rpa_for(&resolver, 0x0070_8194);
        assert_eq!(addr[5] & 0xC0, 0x40);
        assert!(resolver.matches(&addr));
        // cached path
        assert!(resolver.matches(&addr));
    }

    #[test]
    fn rejects_wrong_hash() {
        let mut resolver = RpaResolver::new(&IRK);
        let mut addr = rpa_for(&resolver, 0x0061_C568);
        addr[0] ^= 0x01;
        assert!(!resolver.matches(&addr));
    }

    #[test]
    fn rejects_non_rpa_kinds() {
        let mut resolver = RpaResolver::new(&IRK);
        // static random address (top bits 0b11)
        let mut addr = rpa_for(&resolver, 0x00E1_0203);
        assert_eq!(addr[5] & 0xC0, 0xC0);
        assert!(!resolver.matches(&addr));
        // public-looking address (top bits 0b00)
        addr = rpa_for(&resolver, 0x0001_0203);
        assert!(!resolver.matches(&addr));
    }

    #[test]
    fn different_irk_does_not_match() {
        let resolver_a = RpaResolver::new(&IRK);
        let mut other = [0u8; 16];
        other[0] = 1;
        let mut resolver_b = RpaResolver::new(&other);
        let addr = rpa_for(&resolver_a, 0x0042_AA55);
        assert!(!resolver_b.matches(&addr));
    }
}
