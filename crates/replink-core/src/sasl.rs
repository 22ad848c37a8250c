//! DIGEST-MD5 handshake and optional integrity layer.
//!
//! The exchange rides inside `SaslMessage` frames on the raw (unwrapped)
//! codec path:
//!
//! ```text
//! client                                server
//!   |-- SaslMessage{client_id, ""} ------->|   hello
//!   |<------------- challenge ------------|
//!   |-- digest response ----------------->|
//!   |<------------- rspauth --------------|   both sides complete
//! ```
//!
//! When `auth-int` is negotiated both sides derive signing keys from the
//! session secret and every subsequent application frame is wrapped with an
//! HMAC-MD5 trailer and a sequence number.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};

use crate::error::SaslError;

/// Fixed realm used on both sides of the handshake.
pub const SASL_REALM: &str = "rsc";
/// Fixed protocol/service name; `digest-uri` is `<protocol>/<realm>`.
pub const SASL_PROTOCOL: &str = "rsc";
/// The one mechanism this implementation speaks.
pub const MECH_DIGEST_MD5: &str = "DIGEST-MD5";

const NC: &str = "00000001";
const KIC_MAGIC: &[u8] = b"Digest session key to client-to-server signing key magic constant";
const KIS_MAGIC: &[u8] = b"Digest session key to server-to-client signing key magic constant";
/// Trailer: 10-byte MAC + 2-byte message type + 4-byte sequence number.
const WRAP_TRAILER: usize = 16;
const WRAP_MSG_TYPE: [u8; 2] = [0x00, 0x01];

/// Quality of protection. Confidentiality cipher suites are not implemented;
/// a peer offering only `auth-conf` fails negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslQop {
    /// Authentication only.
    Auth,
    /// Authentication plus per-message integrity.
    AuthInt,
}

impl SaslQop {
    pub fn as_str(self) -> &'static str {
        match self {
            SaslQop::Auth => "auth",
            SaslQop::AuthInt => "auth-int",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auth" => Some(SaslQop::Auth),
            "auth-int" => Some(SaslQop::AuthInt),
            _ => None,
        }
    }
}

/// Send-direction half of the negotiated security layer.
#[derive(Debug)]
pub struct SecuritySend {
    key: [u8; 16],
    seq: u32,
}

/// Receive-direction half of the negotiated security layer.
#[derive(Debug)]
pub struct SecurityRecv {
    key: [u8; 16],
    seq: u32,
}

/// Both halves, as handed to the codec after a successful `auth-int`
/// negotiation.
#[derive(Debug)]
pub struct SecurityPair {
    pub send: SecuritySend,
    pub recv: SecurityRecv,
}

fn mac10(key: &[u8; 16], seq: u32, msg: &[u8]) -> [u8; 10] {
    let mut mac = Hmac::<Md5>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&seq.to_be_bytes());
    mac.update(msg);
    let out = mac.finalize().into_bytes();
    let mut trunc = [0u8; 10];
    trunc.copy_from_slice(&out[..10]);
    trunc
}

impl SecuritySend {
    /// Seal one outbound frame body.
    pub fn wrap(&mut self, msg: &[u8]) -> Vec<u8> {
        let mac = mac10(&self.key, self.seq, msg);
        let mut out = Vec::with_capacity(msg.len() + WRAP_TRAILER);
        out.extend_from_slice(msg);
        out.extend_from_slice(&mac);
        out.extend_from_slice(&WRAP_MSG_TYPE);
        out.extend_from_slice(&self.seq.to_be_bytes());
        self.seq = self.seq.wrapping_add(1);
        out
    }
}

impl SecurityRecv {
    /// Verify and strip the trailer of one inbound frame body.
    pub fn unwrap(&mut self, msg: &[u8]) -> Result<Vec<u8>, SaslError> {
        if msg.len() < WRAP_TRAILER {
            return Err(SaslError::IntegrityViolation);
        }
        let (body, trailer) = msg.split_at(msg.len() - WRAP_TRAILER);
        let (mac, rest) = trailer.split_at(10);
        let (msg_type, seq_bytes) = rest.split_at(2);
        let seq = u32::from_be_bytes(seq_bytes.try_into().expect("4-byte slice"));
        if msg_type != WRAP_MSG_TYPE || seq != self.seq {
            return Err(SaslError::IntegrityViolation);
        }
        if mac != mac10(&self.key, seq, body) {
            return Err(SaslError::IntegrityViolation);
        }
        self.seq = self.seq.wrapping_add(1);
        Ok(body.to_vec())
    }
}

fn md5(data: &[u8]) -> [u8; 16] {
    let mut h = Md5::new();
    h.update(data);
    h.finalize().into()
}

fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5(data))
}

fn digest_uri() -> String {
    format!("{SASL_PROTOCOL}/{SASL_REALM}")
}

/// Raw MD5 of the session A1 string (md5-sess).
fn a1_sess(username: &str, secret: &str, nonce: &str, cnonce: &str) -> [u8; 16] {
    let inner = md5(format!("{username}:{SASL_REALM}:{secret}").as_bytes());
    let mut buf = Vec::with_capacity(16 + nonce.len() + cnonce.len() + 2);
    buf.extend_from_slice(&inner);
    buf.push(b':');
    buf.extend_from_slice(nonce.as_bytes());
    buf.push(b':');
    buf.extend_from_slice(cnonce.as_bytes());
    md5(&buf)
}

/// The `response` / `rspauth` hex digest. `a2_prefix` is `"AUTHENTICATE"`
/// for the client response and empty for the server's rspauth.
fn response_hex(ha1: &[u8; 16], nonce: &str, cnonce: &str, qop: SaslQop, a2_prefix: &str) -> String {
    let mut a2 = format!("{a2_prefix}:{}", digest_uri());
    if qop == SaslQop::AuthInt {
        a2.push_str(":00000000000000000000000000000000");
    }
    let ha2 = md5_hex(a2.as_bytes());
    let kd = format!(
        "{}:{nonce}:{NC}:{cnonce}:{}:{ha2}",
        hex::encode(ha1),
        qop.as_str()
    );
    md5_hex(kd.as_bytes())
}

fn derive_security(ha1: &[u8; 16], is_client: bool) -> SecurityPair {
    let kic = md5(&[&ha1[..], KIC_MAGIC].concat());
    let kis = md5(&[&ha1[..], KIS_MAGIC].concat());
    let (send_key, recv_key) = if is_client { (kic, kis) } else { (kis, kic) };
    SecurityPair {
        send: SecuritySend {
            key: send_key,
            seq: 0,
        },
        recv: SecurityRecv {
            key: recv_key,
            seq: 0,
        },
    }
}

fn fresh_nonce() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// Parse a comma-separated `key=value` directive list, honoring quoting.
fn parse_directives(raw: &[u8]) -> Result<Vec<(String, String)>, SaslError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| SaslError::Malformed("directives are not UTF-8".into()))?;
    let mut out = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| SaslError::Malformed(format!("missing '=' in {rest:?}")))?;
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped
                .find('"')
                .ok_or_else(|| SaslError::Malformed("unterminated quote".into()))?;
            value = stripped[..end].to_string();
            rest = stripped[end + 1..].trim_start_matches(',');
        } else {
            match rest.find(',') {
                Some(comma) => {
                    value = rest[..comma].trim().to_string();
                    rest = &rest[comma + 1..];
                }
                None => {
                    value = rest.trim().to_string();
                    rest = "";
                }
            }
        }
        out.push((key, value));
    }
    Ok(out)
}

fn directive<'a>(dirs: &'a [(String, String)], key: &str) -> Result<&'a str, SaslError> {
    dirs.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| SaslError::Malformed(format!("missing directive {key:?}")))
}

#[derive(Debug)]
enum ClientPhase {
    Initial,
    ResponseSent {
        ha1: [u8; 16],
        nonce: String,
        cnonce: String,
        qop: SaslQop,
    },
    Complete {
        security: Option<SecurityPair>,
    },
}

/// Client side of the handshake.
#[derive(Debug)]
pub struct DigestClient {
    client_id: String,
    secret: String,
    preferred_qop: SaslQop,
    phase: ClientPhase,
}

impl DigestClient {
    pub fn new(mechanism: &str, client_id: &str, secret: &str, qop: SaslQop) -> Result<Self, SaslError> {
        if mechanism != MECH_DIGEST_MD5 {
            return Err(SaslError::UnsupportedMechanism(mechanism.to_string()));
        }
        Ok(Self {
            client_id: client_id.to_string(),
            secret: secret.to_string(),
            preferred_qop: qop,
            phase: ClientPhase::Initial,
        })
    }

    /// DIGEST-MD5 has no initial response; the hello carries an empty token.
    pub fn initial_response(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Feed one server message; returns the bytes to send back, if any.
    pub fn evaluate(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>, SaslError> {
        match std::mem::replace(&mut self.phase, ClientPhase::Initial) {
            ClientPhase::Initial => {
                let dirs = parse_directives(challenge)?;
                let nonce = directive(&dirs, "nonce")?.to_string();
                let offered: Vec<SaslQop> = directive(&dirs, "qop")?
                    .split(',')
                    .filter_map(|s| SaslQop::parse(s.trim()))
                    .collect();
                let qop = if offered.contains(&self.preferred_qop) {
                    self.preferred_qop
                } else if offered.contains(&SaslQop::Auth) {
                    SaslQop::Auth
                } else {
                    return Err(SaslError::QopMismatch(
                        directive(&dirs, "qop")?.to_string(),
                    ));
                };
                let cnonce = fresh_nonce();
                let ha1 = a1_sess(&self.client_id, &self.secret, &nonce, &cnonce);
                let response = response_hex(&ha1, &nonce, &cnonce, qop, "AUTHENTICATE");
                let out = format!(
                    "username=\"{}\",realm=\"{SASL_REALM}\",nonce=\"{nonce}\",\
                     cnonce=\"{cnonce}\",nc={NC},qop={},digest-uri=\"{}\",\
                     response={response},charset=utf-8",
                    self.client_id,
                    qop.as_str(),
                    digest_uri(),
                );
                self.phase = ClientPhase::ResponseSent {
                    ha1,
                    nonce,
                    cnonce,
                    qop,
                };
                Ok(Some(out.into_bytes()))
            }
            ClientPhase::ResponseSent {
                ha1,
                nonce,
                cnonce,
                qop,
            } => {
                let dirs = parse_directives(challenge)?;
                let rspauth = directive(&dirs, "rspauth")?;
                let expected = response_hex(&ha1, &nonce, &cnonce, qop, "");
                if rspauth != expected {
                    return Err(SaslError::AuthenticationFailed);
                }
                let security =
                    (qop == SaslQop::AuthInt).then(|| derive_security(&ha1, true));
                self.phase = ClientPhase::Complete { security };
                Ok(None)
            }
            ClientPhase::Complete { .. } => Err(SaslError::UnexpectedMessage),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, ClientPhase::Complete { .. })
    }

    /// Take the negotiated security layer, if integrity was agreed.
    pub fn take_security(&mut self) -> Option<SecurityPair> {
        match &mut self.phase {
            ClientPhase::Complete { security } => security.take(),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum ServerPhase {
    Initial,
    ChallengeSent { nonce: String },
    Complete { security: Option<SecurityPair> },
}

/// Server side of the handshake; one instance per accepted connection,
/// constructed once the hello identified the client.
#[derive(Debug)]
pub struct DigestServer {
    username: String,
    secret: String,
    offered_qop: Vec<SaslQop>,
    phase: ServerPhase,
}

impl DigestServer {
    pub fn new(username: &str, secret: &str, offered_qop: &[SaslQop]) -> Self {
        Self {
            username: username.to_string(),
            secret: secret.to_string(),
            offered_qop: offered_qop.to_vec(),
            phase: ServerPhase::Initial,
        }
    }

    pub fn initial_challenge(&mut self) -> Vec<u8> {
        let nonce = fresh_nonce();
        let qop = self
            .offered_qop
            .iter()
            .map(|q| q.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let out = format!(
            "realm=\"{SASL_REALM}\",nonce=\"{nonce}\",qop=\"{qop}\",\
             charset=utf-8,algorithm=md5-sess"
        );
        self.phase = ServerPhase::ChallengeSent { nonce };
        out.into_bytes()
    }

    /// Verify the client's digest response; on success returns the rspauth
    /// message completing the exchange.
    pub fn evaluate(&mut self, response: &[u8]) -> Result<Vec<u8>, SaslError> {
        match std::mem::replace(&mut self.phase, ServerPhase::Initial) {
            ServerPhase::ChallengeSent { nonce } => {
                let dirs = parse_directives(response)?;
                let username = directive(&dirs, "username")?;
                let cnonce = directive(&dirs, "cnonce")?.to_string();
                let resp_nonce = directive(&dirs, "nonce")?;
                let qop = SaslQop::parse(directive(&dirs, "qop")?)
                    .ok_or_else(|| SaslError::Malformed("bad qop".into()))?;
                if username != self.username
                    || resp_nonce != nonce
                    || !self.offered_qop.contains(&qop)
                {
                    return Err(SaslError::AuthenticationFailed);
                }
                let ha1 = a1_sess(&self.username, &self.secret, &nonce, &cnonce);
                let expected = response_hex(&ha1, &nonce, &cnonce, qop, "AUTHENTICATE");
                if directive(&dirs, "response")? != expected {
                    return Err(SaslError::AuthenticationFailed);
                }
                let rspauth = response_hex(&ha1, &nonce, &cnonce, qop, "");
                let security =
                    (qop == SaslQop::AuthInt).then(|| derive_security(&ha1, false));
                self.phase = ServerPhase::Complete { security };
                Ok(format!("rspauth={rspauth}").into_bytes())
            }
            ServerPhase::Initial => Err(SaslError::UnexpectedMessage),
            ServerPhase::Complete { .. } => Err(SaslError::UnexpectedMessage),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, ServerPhase::Complete { .. })
    }

    pub fn take_security(&mut self) -> Option<SecurityPair> {
        match &mut self.phase {
            ServerPhase::Complete { security } => security.take(),
            _ => None,
        }
    }
}
