//! Secure mount: Diffie-Hellman key agreement feeding a block cipher.
//!
//! The client picks the finite-field group and sends `p`, `g` and its public value as
//! three big-endian integers, each behind a big-endian `u16` length. The server answers
//! in the same group. Both sides stretch the shared secret with HKDF-SHA256 to the
//! requested key length and key Blowfish with it.
//!
//! Cipher transforms leave the connection id alone and work on whole blocks of the
//! negotiated size: the rest of the frame is zero padded up to the next block boundary,
//! and always to at least one block. Length fields inside messages say how much of it is
//! real.

use {
    crate::{error::Error, session::ByteTransform, utils::Result},
    blowfish::Blowfish,
    byteorder::{BigEndian, ReadBytesExt, WriteBytesExt},
    bytes::BytesMut,
    cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray},
    hkdf::Hkdf,
    num_bigint::{BigUint, RandBigInt},
    sha2::Sha256,
    std::{io::Cursor, sync::Arc},
};

pub const MIN_KEY_BITS: u16 = 64;
pub const MAX_KEY_BITS: u16 = 256;
pub const MAX_BLOCK_SIZE: u16 = 512;

/// Block length of the underlying cipher; negotiated sizes are multiples of it
pub const CIPHER_BLOCK: usize = 8;

const CONN_ID_LEN: usize = 2;
const MIN_GROUP_BITS: u64 = 512;
const MAX_GROUP_BITS: u64 = 8192;
const PRIVATE_BITS: u64 = 256;
const KDF_INFO: &[u8] = b"tnfs secure mount";

/// RFC 3526 group 14 prime
static MODP_2048: [u8; 256] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
    0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
    0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
    0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
    0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
    0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11,
    0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe4, 0x5b, 0x3d,
    0xc2, 0x00, 0x7c, 0xb8, 0xa1, 0x63, 0xbf, 0x05, 0x98, 0xda, 0x48, 0x36,
    0x1c, 0x55, 0xd3, 0x9a, 0x69, 0x16, 0x3f, 0xa8, 0xfd, 0x24, 0xcf, 0x5f,
    0x83, 0x65, 0x5d, 0x23, 0xdc, 0xa3, 0xad, 0x96, 0x1c, 0x62, 0xf3, 0x56,
    0x20, 0x85, 0x52, 0xbb, 0x9e, 0xd5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6d,
    0x67, 0x0c, 0x35, 0x4e, 0x4a, 0xbc, 0x98, 0x04, 0xf1, 0x74, 0x6c, 0x08,
    0xca, 0x18, 0x21, 0x7c, 0x32, 0x90, 0x5e, 0x46, 0x2e, 0x36, 0xce, 0x3b,
    0xe3, 0x9e, 0x77, 0x2c, 0x18, 0x0e, 0x86, 0x03, 0x9b, 0x27, 0x83, 0xa2,
    0xec, 0x07, 0xa2, 0x8f, 0xb5, 0xc5, 0x5d, 0xf0, 0x6f, 0x4c, 0x52, 0xc9,
    0xde, 0x2b, 0xcb, 0xf6, 0x95, 0x58, 0x17, 0x18, 0x39, 0x95, 0x49, 0x7c,
    0xea, 0x95, 0x6a, 0xe5, 0x15, 0xd2, 0x26, 0x18, 0x98, 0xfa, 0x05, 0x10,
    0x15, 0x72, 0x8e, 0x5a, 0x8a, 0xac, 0xaa, 0x68, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff,
];

/// Reject key lengths outside 64..=256 bits or not a whole number of bytes.
pub fn validate_key_bits(bits: u16) -> Result<()> {
    if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) || bits % 8 != 0 {
        return Err(Error::invalid(format!(
            "key length {} bits, expected a multiple of 8 in {}..={}",
            bits, MIN_KEY_BITS, MAX_KEY_BITS
        )));
    }
    Ok(())
}

pub fn validate_block_size(size: u16) -> Result<()> {
    if size == 0 || size > MAX_BLOCK_SIZE || size as usize % CIPHER_BLOCK != 0 {
        return Err(Error::invalid(format!(
            "block size {}, expected a multiple of {} up to {}",
            size, CIPHER_BLOCK, MAX_BLOCK_SIZE
        )));
    }
    Ok(())
}

/// Finite-field Diffie-Hellman domain parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhGroup {
    pub p: BigUint,
    pub g: BigUint,
}

impl Default for DhGroup {
    fn default() -> Self {
        DhGroup::modp2048()
    }
}

impl DhGroup {
    pub fn modp2048() -> DhGroup {
        DhGroup {
            p: BigUint::from_bytes_be(&MODP_2048),
            g: BigUint::from(2u32),
        }
    }

    /// Check parameters received from a peer.
    pub fn new(p: BigUint, g: BigUint) -> Result<DhGroup> {
        if !(MIN_GROUP_BITS..=MAX_GROUP_BITS).contains(&p.bits()) || !p.bit(0) {
            return Err(Error::invalid(format!("unusable {}-bit modulus", p.bits())));
        }
        let one = BigUint::from(1u32);
        if g <= one || g >= &p - &one {
            return Err(Error::invalid("generator out of range"));
        }
        Ok(DhGroup { p, g })
    }

    pub fn generate(&self) -> KeyPair {
        let mut rng = rand::thread_rng();
        let two = BigUint::from(2u32);
        let private = loop {
            let x = rng.gen_biguint(PRIVATE_BITS);
            if x >= two {
                break x;
            }
        };
        KeyPair {
            public: PublicKey {
                group: self.clone(),
                y: self.g.modpow(&private, &self.p),
            },
            private,
        }
    }

    fn byte_len(&self) -> usize {
        self.p.bits().div_ceil(8) as usize
    }
}

/// A public value together with its group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    pub group: DhGroup,
    pub y: BigUint,
}

fn write_mpint(buf: &mut Vec<u8>, n: &BigUint) -> Result<()> {
    let bytes = n.to_bytes_be();
    let len = u16::try_from(bytes.len()).map_err(|_| Error::invalid("integer too large"))?;
    buf.write_u16::<BigEndian>(len)?;
    buf.extend_from_slice(&bytes);
    Ok(())
}

fn read_mpint(r: &mut Cursor<&[u8]>) -> Result<BigUint> {
    let len = r.read_u16::<BigEndian>()? as usize;
    let start = r.position() as usize;
    let bytes = r
        .get_ref()
        .get(start..start + len)
        .ok_or_else(|| Error::invalid("truncated public key"))?;
    r.set_position((start + len) as u64);
    Ok(BigUint::from_bytes_be(bytes))
}

impl PublicKey {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(3 * (2 + self.group.byte_len()));
        write_mpint(&mut buf, &self.group.p)?;
        write_mpint(&mut buf, &self.group.g)?;
        write_mpint(&mut buf, &self.y)?;
        Ok(buf)
    }

    /// Parse and validate a peer's public key blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<PublicKey> {
        let malformed = |e: Error| Error::invalid(format!("malformed public key: {}", e));

        let mut r = Cursor::new(bytes);
        let p = read_mpint(&mut r).map_err(malformed)?;
        let g = read_mpint(&mut r).map_err(malformed)?;
        let y = read_mpint(&mut r).map_err(malformed)?;
        if r.position() as usize != bytes.len() {
            return Err(Error::invalid("malformed public key: trailing bytes"));
        }

        let group = DhGroup::new(p, g).map_err(malformed)?;
        let one = BigUint::from(1u32);
        if y <= one || y >= &group.p - &one {
            return Err(Error::invalid("malformed public key: value out of range"));
        }
        Ok(PublicKey { group, y })
    }
}

pub struct KeyPair {
    public: PublicKey,
    private: BigUint,
}

impl KeyPair {
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Raw shared secret, left padded to the modulus length.
    pub fn agree(&self, peer: &PublicKey) -> Result<Vec<u8>> {
        if peer.group != self.public.group {
            return Err(Error::invalid("peer key uses another group"));
        }
        let secret = peer.y.modpow(&self.private, &self.public.group.p).to_bytes_be();
        let mut out = vec![0; self.public.group.byte_len().saturating_sub(secret.len())];
        out.extend_from_slice(&secret);
        Ok(out)
    }
}

/// Stretch a shared secret to `key_bits` bits.
pub fn derive_key(shared: &[u8], key_bits: u16) -> Result<Vec<u8>> {
    validate_key_bits(key_bits)?;
    let mut key = vec![0; key_bits as usize / 8];
    Hkdf::<Sha256>::new(None, shared)
        .expand(KDF_INFO, &mut key)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    Ok(key)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// One direction of a session cipher
pub struct CipherTransform {
    cipher: Blowfish,
    block_size: usize,
    direction: Direction,
}

impl CipherTransform {
    fn new(key: &[u8], block_size: u16, direction: Direction) -> Result<CipherTransform> {
        validate_block_size(block_size)?;
        Ok(CipherTransform {
            cipher: <Blowfish as KeyInit>::new_from_slice(key)
                .map_err(|e| Error::Crypto(e.to_string()))?,
            block_size: block_size as usize,
            direction,
        })
    }
}

impl ByteTransform for CipherTransform {
    fn apply(&self, frame: &mut BytesMut) -> Result<()> {
        if frame.len() < CONN_ID_LEN {
            return Err(Error::protocol("frame shorter than a connection id"));
        }

        let region = (frame.len() - CONN_ID_LEN).max(1);
        frame.resize(CONN_ID_LEN + region.div_ceil(self.block_size) * self.block_size, 0);

        for block in frame[CONN_ID_LEN..].chunks_exact_mut(CIPHER_BLOCK) {
            let block = GenericArray::from_mut_slice(block);
            match self.direction {
                Direction::Encrypt => self.cipher.encrypt_block(block),
                Direction::Decrypt => self.cipher.decrypt_block(block),
            }
        }
        Ok(())
    }
}

/// A matching pair of transforms for one side of a channel
pub struct CipherPair {
    pub encrypt: Arc<dyn ByteTransform>,
    pub decrypt: Arc<dyn ByteTransform>,
    /// Most bytes padding may add to a frame
    pub overhead: usize,
}

pub fn cipher_pair(key: &[u8], block_size: u16) -> Result<CipherPair> {
    Ok(CipherPair {
        encrypt: Arc::new(CipherTransform::new(key, block_size, Direction::Encrypt)?),
        decrypt: Arc::new(CipherTransform::new(key, block_size, Direction::Decrypt)?),
        overhead: block_size as usize - 1,
    })
}

/// Server side of the exchange: our public key blob and the derived key.
pub struct Agreement {
    pub public_key: Vec<u8>,
    pub key: Vec<u8>,
}

/// Validate the request, answer in the client's group and derive the session key.
///
/// Sizes are checked before any cryptographic work.
pub fn server_agree(client_public: &[u8], key_bits: u16, block_size: u16) -> Result<Agreement> {
    validate_key_bits(key_bits)?;
    validate_block_size(block_size)?;

    let peer = PublicKey::from_bytes(client_public)?;
    let ours = peer.group.generate();
    let shared = ours.agree(&peer)?;

    Ok(Agreement {
        public_key: ours.public_key().to_bytes()?,
        key: derive_key(&shared, key_bits)?,
    })
}

/// Client side of the exchange.
pub struct ClientHandshake {
    keys: KeyPair,
    key_bits: u16,
    block_size: u16,
}

impl ClientHandshake {
    pub fn new(group: &DhGroup, key_bits: u16, block_size: u16) -> Result<ClientHandshake> {
        validate_key_bits(key_bits)?;
        validate_block_size(block_size)?;
        Ok(ClientHandshake {
            keys: group.generate(),
            key_bits,
            block_size,
        })
    }

    pub fn key_bits(&self) -> u16 {
        self.key_bits
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    pub fn public_key(&self) -> Result<Vec<u8>> {
        self.keys.public_key().to_bytes()
    }

    /// Derive the session key from the server's answer.
    pub fn finish(&self, server_public: &[u8]) -> Result<Vec<u8>> {
        let peer = PublicKey::from_bytes(server_public)?;
        let shared = self.keys.agree(&peer)?;
        derive_key(&shared, self.key_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn key_sizes_are_checked_first() {
        for bits in [0, 8, 56, 63, 65, 100, 257, 264, u16::MAX] {
            let err = server_agree(b"not a key", bits, 8).err().unwrap();
            assert!(err.to_string().contains("key length"), "{}", err);
        }
        assert!(server_agree(b"not a key", 64, 8).err().unwrap().to_string().contains("malformed"));

        for size in [0, 4, 12, 520] {
            assert!(validate_block_size(size).is_err());
        }
        validate_block_size(8).unwrap();
        validate_block_size(512).unwrap();
    }

    #[test]
    fn both_sides_derive_the_same_key() {
        let group = DhGroup::modp2048();
        for bits in (MIN_KEY_BITS..=MAX_KEY_BITS).step_by(8) {
            let client = ClientHandshake::new(&group, bits, 16).unwrap();
            let server = server_agree(&client.public_key().unwrap(), bits, 16).unwrap();
            let key = client.finish(&server.public_key).unwrap();
            assert_eq!(key, server.key);
            assert_eq!(key.len(), bits as usize / 8);
        }
    }

    #[test]
    fn malformed_public_keys() {
        let group = DhGroup::modp2048();
        let good = group.generate().public_key().to_bytes().unwrap();
        assert!(PublicKey::from_bytes(&good).is_ok());

        assert!(PublicKey::from_bytes(&good[..good.len() - 1]).is_err());
        let mut trailing = good.clone();
        trailing.push(0);
        assert!(PublicKey::from_bytes(&trailing).is_err());

        let one = PublicKey {
            group: group.clone(),
            y: BigUint::from(1u32),
        };
        assert!(PublicKey::from_bytes(&one.to_bytes().unwrap()).is_err());

        let tiny = PublicKey {
            group: DhGroup {
                p: BigUint::from(23u32),
                g: BigUint::from(5u32),
            },
            y: BigUint::from(8u32),
        };
        assert!(PublicKey::from_bytes(&tiny.to_bytes().unwrap()).is_err());
    }

    #[test]
    fn short_frames_are_padded_to_one_block() {
        let pair = cipher_pair(&[7; 16], 16).unwrap();
        for len in [2, 3, 17, 18, 19] {
            let plain: Vec<u8> = (0..len as u8).collect();
            let mut frame = BytesMut::from(&plain[..]);
            pair.encrypt.apply(&mut frame).unwrap();
            assert_eq!(&frame[..2], &plain[..2]);
            assert!(frame.len() >= 2 + 16);
            assert_eq!((frame.len() - 2) % 16, 0);

            pair.decrypt.apply(&mut frame).unwrap();
            assert_eq!(&frame[..len], &plain[..]);
            assert!(frame[len..].iter().all(|&b| b == 0));
        }

        let mut frame = BytesMut::from(&[1u8][..]);
        assert!(pair.encrypt.apply(&mut frame).is_err());
    }

    #[test]
    fn distinct_keys_do_not_interoperate() {
        let a = cipher_pair(&[1; 8], 8).unwrap();
        let b = cipher_pair(&[2; 8], 8).unwrap();
        let mut frame = BytesMut::from(&b"\x01\x02hello world!"[..]);
        a.encrypt.apply(&mut frame).unwrap();
        b.decrypt.apply(&mut frame).unwrap();
        assert_ne!(&frame[2..14], b"hello world!");
    }

    proptest! {
        #[test]
        fn cipher_round_trip(
            body in proptest::collection::vec(any::<u8>(), 3..600),
            blocks in 1u16..8,
            key in proptest::collection::vec(any::<u8>(), 8..=32),
        ) {
            let pair = cipher_pair(&key, blocks * 8).unwrap();
            let mut frame = BytesMut::from(&body[..]);
            pair.encrypt.apply(&mut frame).unwrap();
            prop_assert_eq!(&frame[..2], &body[..2]);
            prop_assert!(frame.len() - body.len() <= pair.overhead);
            pair.decrypt.apply(&mut frame).unwrap();
            prop_assert_eq!(&frame[..body.len()], &body[..]);
        }
    }
}
