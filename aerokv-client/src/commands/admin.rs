//! Security commands: login and per-connection authentication.
//!
//! Admin exchanges ride in proto frames of type 2 with a 16-byte
//! header (scheme, result slot, command, field count, reserved). The
//! password never crosses the wire in the clear; a bcrypt hash with a
//! protocol-fixed salt is sent instead, and the returned session token
//! authenticates pooled connections from then on.

use std::time::{Duration, Instant};

use aerokv_core::protocol::constants::admin;
use aerokv_core::protocol::constants::msg_type;
use aerokv_core::protocol::ProtoFrame;
use aerokv_core::{AerokvError, Result};
use bytes::{Buf, BufMut, BytesMut};

use crate::config::AuthConfig;
use crate::net::Connection;

/// Raw bytes of the fixed bcrypt salt `$2a$10$7EqJtq98hPqEX7fNZaFWoO`.
const CREDENTIAL_SALT: [u8; 16] = [
    0xf4, 0x6b, 0x0b, 0xbe, 0xcf, 0xfe, 0x8d, 0x1b, 0x06, 0x67, 0xd8, 0x4f, 0x6d, 0xc1, 0xd8,
    0xa9,
];
const CREDENTIAL_COST: u32 = 10;

/// A session granted by login, shared by every connection to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Opaque token presented on authenticate.
    pub token: Vec<u8>,
    /// How long the server will honor the token.
    pub ttl: Option<Duration>,
    /// When the token was issued.
    pub issued_at: Instant,
}

impl Session {
    /// True once the token is within 10% of its TTL; the tend loop
    /// re-logs-in before the server starts rejecting it.
    pub fn needs_refresh(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.issued_at.elapsed() >= ttl.mul_f64(0.9),
            None => false,
        }
    }
}

fn hash_password(password: &str) -> Result<String> {
    let parts = bcrypt::hash_with_salt(password, CREDENTIAL_COST, CREDENTIAL_SALT)
        .map_err(|e| AerokvError::Authentication(format!("failed to hash credential: {}", e)))?;
    Ok(parts.format_for_version(bcrypt::Version::TwoA))
}

fn build_admin_frame(command: u8, fields: &[(u8, &[u8])]) -> ProtoFrame {
    let mut payload = BytesMut::new();
    payload.put_u8(0);
    payload.put_u8(0);
    payload.put_u8(command);
    payload.put_u8(fields.len() as u8);
    payload.put_bytes(0, admin::HEADER_SIZE - 4);
    for (field_type, data) in fields {
        payload.put_u32(data.len() as u32 + 1);
        payload.put_u8(*field_type);
        payload.put_slice(data);
    }
    ProtoFrame::new(msg_type::ADMIN, payload)
}

fn parse_admin_response(frame: &ProtoFrame) -> Result<Vec<(u8, Vec<u8>)>> {
    if frame.payload.len() < admin::HEADER_SIZE {
        return Err(AerokvError::Protocol(format!(
            "admin response of {} bytes is shorter than its header",
            frame.payload.len()
        )));
    }
    let code = frame.payload[admin::RESULT_CODE_OFFSET];
    if code != 0 {
        return Err(AerokvError::from_code(code, None));
    }

    let mut rest = &frame.payload[admin::HEADER_SIZE..];
    let mut fields = Vec::new();
    while rest.remaining() >= 5 {
        let len = rest.get_u32() as usize;
        if len == 0 || rest.remaining() < len {
            return Err(AerokvError::Protocol(
                "truncated field in admin response".into(),
            ));
        }
        let field_type = rest.get_u8();
        let mut data = vec![0u8; len - 1];
        rest.copy_to_slice(&mut data);
        fields.push((field_type, data));
    }
    Ok(fields)
}

/// Logs in with the configured credentials, returning the session.
#[tracing::instrument(skip_all, fields(user = auth.username()))]
pub async fn login(conn: &mut Connection, auth: &AuthConfig) -> Result<Session> {
    let credential = hash_password(auth.password())?;
    let frame = build_admin_frame(
        admin::LOGIN,
        &[
            (admin::FIELD_USER, auth.username().as_bytes()),
            (admin::FIELD_CREDENTIAL, credential.as_bytes()),
        ],
    );
    let response = conn.round_trip(frame).await?;
    let fields = parse_admin_response(&response)?;

    let mut token = None;
    let mut ttl = None;
    for (field_type, data) in fields {
        match field_type {
            admin::FIELD_SESSION_TOKEN => token = Some(data),
            admin::FIELD_SESSION_TTL => {
                if data.len() == 4 {
                    let secs = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                    ttl = Some(Duration::from_secs(u64::from(secs)));
                }
            }
            _ => {}
        }
    }
    let token = token.ok_or_else(|| {
        AerokvError::Authentication("login response carried no session token".into())
    })?;
    tracing::debug!(ttl = ?ttl, "login succeeded");
    Ok(Session {
        token,
        ttl,
        issued_at: Instant::now(),
    })
}

/// Authenticates a freshly opened connection with a session token.
pub async fn authenticate(conn: &mut Connection, username: &str, session: &Session) -> Result<()> {
    let frame = build_admin_frame(
        admin::AUTHENTICATE,
        &[
            (admin::FIELD_USER, username.as_bytes()),
            (admin::FIELD_SESSION_TOKEN, &session.token),
        ],
    );
    let response = conn.round_trip(frame).await?;
    parse_admin_response(&response).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_uses_fixed_salt() {
        let hash = hash_password("password123").unwrap();
        assert!(hash.starts_with("$2a$10$7EqJtq98hPqEX7fNZaFWoO"));
        // Same password, same bytes: the credential must be stable.
        assert_eq!(hash, hash_password("password123").unwrap());
    }

    #[test]
    fn admin_frame_layout() {
        let frame = build_admin_frame(admin::LOGIN, &[(admin::FIELD_USER, b"admin")]);
        assert_eq!(frame.msg_type, msg_type::ADMIN);
        assert_eq!(frame.payload[2], admin::LOGIN);
        assert_eq!(frame.payload[3], 1);
        // Field: len 6 (type byte + "admin"), type, data.
        assert_eq!(&frame.payload[admin::HEADER_SIZE..admin::HEADER_SIZE + 4], &6u32.to_be_bytes());
        assert_eq!(frame.payload[admin::HEADER_SIZE + 4], admin::FIELD_USER);
        assert_eq!(&frame.payload[admin::HEADER_SIZE + 5..], b"admin");
    }

    #[test]
    fn admin_error_code_maps_to_authentication() {
        let mut payload = BytesMut::zeroed(admin::HEADER_SIZE);
        payload[admin::RESULT_CODE_OFFSET] = 62; // invalid credential
        let frame = ProtoFrame::new(msg_type::ADMIN, payload);
        let err = parse_admin_response(&frame).unwrap_err();
        assert!(matches!(err, AerokvError::Authentication(_)));
    }

    #[test]
    fn session_refresh_threshold() {
        let session = |ttl| Session {
            token: vec![1],
            ttl,
            issued_at: Instant::now(),
        };
        assert!(!session(Some(Duration::from_secs(3600))).needs_refresh());
        assert!(session(Some(Duration::ZERO)).needs_refresh());
        assert!(!session(None).needs_refresh());
    }

    #[test]
    fn session_fields_parsed() {
        let mut payload = BytesMut::zeroed(admin::HEADER_SIZE);
        payload.put_u32(4);
        payload.put_u8(admin::FIELD_SESSION_TOKEN);
        payload.put_slice(b"tok");
        payload.put_u32(5);
        payload.put_u8(admin::FIELD_SESSION_TTL);
        payload.put_u32(3600);
        let fields = parse_admin_response(&ProtoFrame::new(msg_type::ADMIN, payload)).unwrap();
        assert_eq!(fields[0], (admin::FIELD_SESSION_TOKEN, b"tok".to_vec()));
        assert_eq!(fields[1].1, 3600u32.to_be_bytes());
    }
}
