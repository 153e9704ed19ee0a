//! SCRAM mutual authentication (RFC 5802) for `ClientFirst`/`ClientFinal`.
//!
//! The server side keeps only derived keys in a [`ScramPrincipal`]; the password never
//! leaves the client. The mechanism of a record is announced to the client with an `h=`
//! extension attribute at the end of the server-first message.
//!
//! Channel binding uses the `tnfs-server-key` type: the binding data is the server key
//! advertised by `Capabilities`.

use {
    crate::{error::Error, utils::Result},
    base64::{Engine, engine::general_purpose::STANDARD},
    hmac::{Hmac, Mac},
    rand::RngCore,
    sha2::{Digest, Sha256, Sha512},
    subtle::ConstantTimeEq,
};

/// Channel binding type name used in gs2 headers
pub const CHANNEL_BINDING: &str = "tnfs-server-key";

/// Iteration count of generated records
pub const DEFAULT_ITERATIONS: u32 = 4096;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 18;
const MAX_ITERATIONS: u32 = 1 << 20;

macro_rules! with_digest {
    ($mechanism:expr, $digest:ident => $body:expr) => {
        match $mechanism {
            Mechanism::Sha256 => {
                type $digest = Sha256;
                $body
            }
            Mechanism::Sha512 => {
                type $digest = Sha512;
                $body
            }
        }
    };
}

/// Hash function behind a SCRAM mechanism
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Mechanism {
    Sha256,
    Sha512,
}

impl Mechanism {
    pub fn name(self) -> &'static str {
        match self {
            Mechanism::Sha256 => "SCRAM-SHA-256",
            Mechanism::Sha512 => "SCRAM-SHA-512",
        }
    }

    /// Name of the channel-binding variant
    pub fn plus_name(self) -> String {
        format!("{}-PLUS", self.name())
    }

    /// Parse a mechanism name, with or without the `-PLUS` suffix.
    pub fn from_name(name: &str) -> Option<Mechanism> {
        match name.strip_suffix("-PLUS").unwrap_or(name) {
            "SCRAM-SHA-256" => Some(Mechanism::Sha256),
            "SCRAM-SHA-512" => Some(Mechanism::Sha512),
            _ => None,
        }
    }

    fn output_len(self) -> usize {
        match self {
            Mechanism::Sha256 => 32,
            Mechanism::Sha512 => 64,
        }
    }

    /// `Hi()`: PBKDF2 with this mechanism's HMAC
    pub fn salted_password(self, password: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut out = vec![0; self.output_len()];
        with_digest!(self, D => pbkdf2::pbkdf2_hmac::<D>(password.as_bytes(), salt, iterations, &mut out));
        out
    }

    pub fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        with_digest!(self, D => {
            let mut mac = <Hmac<D> as Mac>::new_from_slice(key)
                .map_err(|e| Error::Crypto(e.to_string()))?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        })
    }

    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        with_digest!(self, D => D::digest(data).to_vec())
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

fn new_nonce() -> String {
    STANDARD.encode(random_bytes(NONCE_LEN))
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

fn decode_b64(value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| Error::protocol(format!("invalid base64: {}", e)))
}

/// Stored SCRAM credentials of a user
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScramPrincipal {
    pub name: String,
    pub mechanism: Mechanism,
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

impl ScramPrincipal {
    /// Derive a record from a password with a fresh random salt.
    pub fn from_password(
        name: &str,
        password: &str,
        mechanism: Mechanism,
        iterations: u32,
    ) -> Result<ScramPrincipal> {
        if iterations == 0 || iterations > MAX_ITERATIONS {
            return Err(Error::invalid(format!("iteration count {}", iterations)));
        }

        let salt = random_bytes(SALT_LEN);
        let salted = mechanism.salted_password(password, &salt, iterations);
        let client_key = mechanism.hmac(&salted, b"Client Key")?;

        Ok(ScramPrincipal {
            name: name.to_owned(),
            mechanism,
            stored_key: mechanism.hash(&client_key),
            server_key: mechanism.hmac(&salted, b"Server Key")?,
            salt,
            iterations,
        })
    }

    /// A record for a user that does not exist.
    ///
    /// It has the shape of a real one but its keys come from no password at all, so every
    /// proof against it fails. `mechanism` and `iterations` should match the server's
    /// stored credentials.
    pub fn fake(name: &str, mechanism: Mechanism, iterations: u32) -> ScramPrincipal {
        ScramPrincipal {
            name: name.to_owned(),
            mechanism,
            salt: random_bytes(SALT_LEN),
            iterations,
            stored_key: random_bytes(mechanism.output_len()),
            server_key: random_bytes(mechanism.output_len()),
        }
    }

    /// Check a plain password by deriving the stored key again.
    pub fn verify_password(&self, password: &str) -> Result<bool> {
        let salted = self
            .mechanism
            .salted_password(password, &self.salt, self.iterations);
        let client_key = self.mechanism.hmac(&salted, b"Client Key")?;
        Ok(ct_eq(&self.mechanism.hash(&client_key), &self.stored_key))
    }
}

fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn unescape_name(name: &str) -> Result<String> {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(i) = rest.find('=') {
        out.push_str(&rest[..i]);
        match rest.get(i..i + 3) {
            Some("=3D") => out.push('='),
            Some("=2C") => out.push(','),
            _ => return Err(Error::protocol("bad escape in user name")),
        }
        rest = &rest[i + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Split `k=v,k=v` into pairs, keeping values verbatim.
fn attributes(msg: &str) -> Result<Vec<(char, &str)>> {
    msg.split(',')
        .map(|attr| {
            let mut chars = attr.chars();
            match (chars.next(), chars.next()) {
                (Some(key), Some('=')) if key.is_ascii_alphabetic() => Ok((key, &attr[2..])),
                _ => Err(Error::protocol(format!("malformed attribute {:?}", attr))),
            }
        })
        .collect()
}

fn valid_nonce(nonce: &str) -> bool {
    !nonce.is_empty() && nonce.bytes().all(|b| (0x21..=0x7e).contains(&b) && b != b',')
}

/// Channel binding flag of a gs2 header
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelBinding {
    /// `n`: the client does not support channel binding
    None,
    /// `y`: the client supports it but believes the server does not
    Unused,
    /// `p=<type>`
    Bound(String),
}

/// A parsed client-first message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientFirst {
    pub gs2_header: String,
    pub binding: ChannelBinding,
    pub user: String,
    pub nonce: String,
    /// The message without its gs2 header, as it enters the auth message
    pub bare: String,
}

impl ClientFirst {
    pub fn parse(msg: &str) -> Result<ClientFirst> {
        let mut parts = msg.splitn(3, ',');
        let (flag, authzid, bare) = match (parts.next(), parts.next(), parts.next()) {
            (Some(f), Some(a), Some(b)) => (f, a, b),
            _ => return Err(Error::protocol("truncated client-first message")),
        };

        let binding = match flag {
            "n" => ChannelBinding::None,
            "y" => ChannelBinding::Unused,
            f => match f.strip_prefix("p=") {
                Some(name) if !name.is_empty() => ChannelBinding::Bound(name.to_owned()),
                _ => return Err(Error::protocol(format!("bad channel binding flag {:?}", f))),
            },
        };
        if !authzid.is_empty() && !authzid.starts_with("a=") {
            return Err(Error::protocol("bad authorization identity"));
        }

        let attrs = attributes(bare)?;
        let (user, nonce) = match attrs.as_slice() {
            [('n', user), ('r', nonce), ..] => (unescape_name(user)?, nonce.to_string()),
            _ => return Err(Error::protocol("client-first needs n= then r=")),
        };
        if user.is_empty() || !valid_nonce(&nonce) {
            return Err(Error::protocol("empty user name or invalid nonce"));
        }

        Ok(ClientFirst {
            gs2_header: format!("{},{},", flag, authzid),
            binding,
            user,
            nonce,
            bare: bare.to_owned(),
        })
    }
}

/// Server half of a handshake between `ClientFirst` and `ClientFinal`.
#[derive(Clone, Debug)]
pub struct ScramServerState {
    client_first: ClientFirst,
    server_first: String,
    nonce: String,
    principal: ScramPrincipal,
}

impl ScramServerState {
    /// Answer a client-first message with the record chosen for its user.
    pub fn start(client_first: ClientFirst, principal: ScramPrincipal) -> (ScramServerState, String) {
        let nonce = format!("{}{}", client_first.nonce, new_nonce());
        let mut server_first = format!(
            "r={},s={},i={}",
            nonce,
            STANDARD.encode(&principal.salt),
            principal.iterations
        );
        if principal.mechanism != Mechanism::Sha256 {
            server_first.push_str(",h=");
            server_first.push_str(principal.mechanism.name());
        }

        let state = ScramServerState {
            client_first,
            server_first: server_first.clone(),
            nonce,
            principal,
        };
        (state, server_first)
    }

    pub fn client_nonce(&self) -> &str {
        &self.client_first.nonce
    }

    pub fn user(&self) -> &str {
        &self.client_first.user
    }

    /// Verify a client-final message.
    ///
    /// Returns the verified record and the server-final message carrying the server
    /// signature. `binding_data` is only consulted for bound channels.
    pub fn finish(self, client_final: &str, binding_data: &[u8]) -> Result<(ScramPrincipal, String)> {
        let attrs = attributes(client_final)?;
        if let Some((key, _)) = attrs.iter().find(|(k, _)| !matches!(k, 'c' | 'r' | 'p')) {
            return Err(Error::protocol(format!("unexpected attribute {:?}", key)));
        }
        let (binding, nonce, proof) = match attrs.as_slice() {
            [('c', c), ('r', r), ('p', p)] => (*c, *r, decode_b64(p)?),
            _ => return Err(Error::protocol("client-final needs c=, r= and p=")),
        };

        if !nonce.starts_with(self.client_first.nonce.as_str()) || nonce != self.nonce {
            return Err(Error::AuthenticationFailed);
        }

        let mut expected_binding = self.client_first.gs2_header.as_bytes().to_vec();
        if let ChannelBinding::Bound(ref name) = self.client_first.binding {
            if name != CHANNEL_BINDING {
                return Err(Error::AuthenticationFailed);
            }
            expected_binding.extend_from_slice(binding_data);
        }
        if !ct_eq(&decode_b64(binding)?, &expected_binding) {
            return Err(Error::AuthenticationFailed);
        }

        let without_proof = match client_final.rfind(",p=") {
            Some(i) => &client_final[..i],
            None => return Err(Error::protocol("missing proof")),
        };
        let auth_message = format!(
            "{},{},{}",
            self.client_first.bare, self.server_first, without_proof
        );

        let mechanism = self.principal.mechanism;
        if proof.len() != mechanism.output_len() {
            return Err(Error::AuthenticationFailed);
        }
        let signature = mechanism.hmac(&self.principal.stored_key, auth_message.as_bytes())?;
        let client_key = xor(&proof, &signature);
        if !ct_eq(&mechanism.hash(&client_key), &self.principal.stored_key) {
            return Err(Error::AuthenticationFailed);
        }

        let server_signature = mechanism.hmac(&self.principal.server_key, auth_message.as_bytes())?;
        Ok((
            self.principal,
            format!("v={}", STANDARD.encode(server_signature)),
        ))
    }
}

/// Client half of a handshake.
pub struct ScramClient {
    password: String,
    nonce: String,
    gs2_header: String,
    binding_data: Vec<u8>,
    bare: String,
}

impl ScramClient {
    /// `binding_data` selects channel binding with the server key it carries.
    pub fn new(user: &str, password: &str, binding_data: Option<&[u8]>) -> ScramClient {
        ScramClient::with_nonce(user, password, binding_data, &new_nonce())
    }

    pub fn with_nonce(
        user: &str,
        password: &str,
        binding_data: Option<&[u8]>,
        nonce: &str,
    ) -> ScramClient {
        let gs2_header = match binding_data {
            Some(_) => format!("p={},,", CHANNEL_BINDING),
            None => "n,,".to_owned(),
        };
        ScramClient {
            password: password.to_owned(),
            nonce: nonce.to_owned(),
            gs2_header,
            binding_data: binding_data.map(<[u8]>::to_vec).unwrap_or_default(),
            bare: format!("n={},r={}", escape_name(user), nonce),
        }
    }

    pub fn client_first(&self) -> String {
        format!("{}{}", self.gs2_header, self.bare)
    }

    /// Answer the server-first message; returns the client-final message and the state
    /// needed to check the server signature.
    pub fn client_final(&self, server_first: &str) -> Result<(String, ScramClientFinal)> {
        let attrs = attributes(server_first)?;
        let (nonce, salt, iterations, extensions) = match attrs.as_slice() {
            [('r', r), ('s', s), ('i', i), rest @ ..] => (*r, decode_b64(s)?, *i, rest),
            _ => return Err(Error::protocol("server-first needs r=, s= and i=")),
        };
        let iterations: u32 = iterations
            .parse()
            .map_err(|_| Error::protocol("bad iteration count"))?;
        if iterations == 0 || iterations > MAX_ITERATIONS {
            return Err(Error::protocol(format!("iteration count {}", iterations)));
        }
        if !nonce.starts_with(self.nonce.as_str()) || nonce.len() == self.nonce.len() {
            return Err(Error::AuthenticationFailed);
        }
        let mechanism = match extensions.iter().find(|(k, _)| *k == 'h') {
            Some((_, name)) => Mechanism::from_name(name)
                .ok_or_else(|| Error::protocol(format!("unknown mechanism {}", name)))?,
            None => Mechanism::Sha256,
        };

        let mut binding = self.gs2_header.as_bytes().to_vec();
        binding.extend_from_slice(&self.binding_data);
        let without_proof = format!("c={},r={}", STANDARD.encode(binding), nonce);
        let auth_message = format!("{},{},{}", self.bare, server_first, without_proof);

        let salted = mechanism.salted_password(&self.password, &salt, iterations);
        let client_key = mechanism.hmac(&salted, b"Client Key")?;
        let stored_key = mechanism.hash(&client_key);
        let signature = mechanism.hmac(&stored_key, auth_message.as_bytes())?;
        let proof = xor(&client_key, &signature);

        let server_key = mechanism.hmac(&salted, b"Server Key")?;
        let expected = mechanism.hmac(&server_key, auth_message.as_bytes())?;

        Ok((
            format!("{},p={}", without_proof, STANDARD.encode(proof)),
            ScramClientFinal { expected },
        ))
    }
}

/// Expected server signature of a handshake
#[derive(Debug)]
pub struct ScramClientFinal {
    expected: Vec<u8>,
}

impl ScramClientFinal {
    /// Check the server-final message; a mismatch means the server does not know the
    /// user's keys.
    pub fn verify(&self, server_final: &str) -> Result<()> {
        let signature = match attributes(server_final)?.as_slice() {
            [('v', v), ..] => decode_b64(v)?,
            _ => return Err(Error::AuthenticationFailed),
        };
        if ct_eq(&signature, &self.expected) {
            Ok(())
        } else {
            Err(Error::AuthenticationFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7677, section 3
    const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str = "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const CLIENT_FINAL: &str = "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    fn handshake(
        principal: ScramPrincipal,
        client: &ScramClient,
        binding_data: &[u8],
    ) -> Result<(ScramPrincipal, String, ScramClientFinal)> {
        let first = ClientFirst::parse(&client.client_first())?;
        let (state, server_first) = ScramServerState::start(first, principal);
        let (client_final, verifier) = client.client_final(&server_first)?;
        let (principal, server_final) = state.finish(&client_final, binding_data)?;
        Ok((principal, server_final, verifier))
    }

    #[test]
    fn client_matches_rfc7677_vector() {
        let client = ScramClient::with_nonce("user", "pencil", None, CLIENT_NONCE);
        assert_eq!(client.client_first(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let (client_final, verifier) = client.client_final(SERVER_FIRST).unwrap();
        assert_eq!(client_final, CLIENT_FINAL);
        verifier.verify(SERVER_FINAL).unwrap();
    }

    #[test]
    fn both_mechanisms_complete() {
        for mechanism in [Mechanism::Sha256, Mechanism::Sha512] {
            let principal = ScramPrincipal::from_password("alice", "secret", mechanism, 128).unwrap();
            let client = ScramClient::new("alice", "secret", None);
            let (principal, server_final, verifier) = handshake(principal, &client, b"").unwrap();
            assert_eq!(principal.name, "alice");
            verifier.verify(&server_final).unwrap();
        }
    }

    #[test]
    fn channel_binding_must_match_server_key() {
        let principal = ScramPrincipal::from_password("alice", "secret", Mechanism::Sha256, 64).unwrap();
        let client = ScramClient::new("alice", "secret", Some(b"server key"));
        assert!(handshake(principal.clone(), &client, b"server key").is_ok());

        let err = handshake(principal, &client, b"other key").unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed));
    }

    #[test]
    fn wrong_password_fails_at_final() {
        let principal = ScramPrincipal::from_password("alice", "secret", Mechanism::Sha256, 64).unwrap();
        let client = ScramClient::new("alice", "guess", None);

        let first = ClientFirst::parse(&client.client_first()).unwrap();
        let (state, server_first) = ScramServerState::start(first, principal);
        let (client_final, _) = client.client_final(&server_first).unwrap();
        assert!(matches!(
            state.finish(&client_final, b""),
            Err(Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn fake_record_looks_real() {
        let client = ScramClient::new("nobody", "pw", None);
        let first = ClientFirst::parse(&client.client_first()).unwrap();
        let fake = ScramPrincipal::fake("nobody", Mechanism::Sha256, DEFAULT_ITERATIONS);
        let (state, server_first) = ScramServerState::start(first, fake);

        let attrs = attributes(&server_first).unwrap();
        let keys: Vec<char> = attrs.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!['r', 's', 'i']);
        assert_eq!(attrs[2].1, DEFAULT_ITERATIONS.to_string());

        let (client_final, _) = client.client_final(&server_first).unwrap();
        assert!(state.finish(&client_final, b"").is_err());

        let first = ClientFirst::parse(&client.client_first()).unwrap();
        let fake = ScramPrincipal::fake("nobody", Mechanism::Sha512, 10000);
        let (_, server_first) = ScramServerState::start(first, fake);
        let attrs = attributes(&server_first).unwrap();
        assert_eq!(attrs[2], ('i', "10000"));
        assert_eq!(attrs[3], ('h', "SCRAM-SHA-512"));
    }

    #[test]
    fn foreign_nonce_is_rejected_even_with_valid_proof() {
        let principal = ScramPrincipal::from_password("alice", "secret", Mechanism::Sha256, 64).unwrap();
        let client = ScramClient::new("alice", "secret", None);
        let first = ClientFirst::parse(&client.client_first()).unwrap();
        let (state, server_first) = ScramServerState::start(first, principal);

        // Let the client compute a proof over a server-first carrying a different nonce.
        let forged = server_first.replacen(
            &format!("r={}", state.client_nonce()),
            &format!("r={}X", state.client_nonce()),
            1,
        );
        let (client_final, _) = client.client_final(&forged).unwrap();
        assert!(matches!(
            state.finish(&client_final, b""),
            Err(Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn unknown_attributes_are_protocol_errors() {
        let principal = ScramPrincipal::fake("alice", Mechanism::Sha256, DEFAULT_ITERATIONS);
        let first = ClientFirst::parse("n,,n=alice,r=abc").unwrap();
        let (state, _) = ScramServerState::start(first, principal);
        assert!(matches!(
            state.finish("c=biws,r=abc,x=1,p=AAAA", b""),
            Err(Error::Protocol(_))
        ));

        assert!(ClientFirst::parse("q,,n=alice,r=abc").is_err());
        assert!(ClientFirst::parse("n,,r=abc").is_err());
        assert!(ClientFirst::parse("n,,n=a=2Xb,r=abc").is_err());
    }

    #[test]
    fn names_are_escaped() {
        let client = ScramClient::with_nonce("a,b=c", "pw", None, "xyz");
        let first = ClientFirst::parse(&client.client_first()).unwrap();
        assert_eq!(first.user, "a,b=c");
        assert_eq!(first.bare, "n=a=2Cb=3Dc,r=xyz");
    }

    #[test]
    fn mechanism_names() {
        assert_eq!(Mechanism::from_name("SCRAM-SHA-512-PLUS"), Some(Mechanism::Sha512));
        assert_eq!(Mechanism::Sha256.plus_name(), "SCRAM-SHA-256-PLUS");
        assert_eq!(Mechanism::from_name("PLAIN"), None);
    }

    #[test]
    fn stored_password_check() {
        let principal = ScramPrincipal::from_password("alice", "secret", Mechanism::Sha256, 16).unwrap();
        assert!(principal.verify_password("secret").unwrap());
        assert!(!principal.verify_password("Secret").unwrap());
        assert!(ScramPrincipal::from_password("alice", "x", Mechanism::Sha256, 0).is_err());
    }
}
