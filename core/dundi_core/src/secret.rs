//! Rotating local secret
//!
//! The secret is substituted into `${SECRET}` destinations so that callers
//! routed to us through DUNDi can be told apart from everyone else. It
//! rotates every hour; the previous value stays stored next to the current
//! one so routes handed out just before a rotation keep working.

use ring::rand::{SecureRandom, SystemRandom};

use crate::crypto::CryptoError;
use crate::error::Result;
use crate::store::KvStore;

/// Rotation period, seconds
pub const SECRET_TIME: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub current: String,
    /// Epoch second at which the next rotation is due
    pub rotate_at: u64,
}

fn build_secret() -> std::result::Result<String, CryptoError> {
    let mut raw = [0u8; 16];
    SystemRandom::new().fill(&mut raw).map_err(|_| CryptoError::Rng)?;
    Ok(hex::encode(raw))
}

fn save(store: &dyn KvStore, path: &str, new: &str, old: Option<&str>, now: u64) -> Result<u64> {
    let value = match old {
        Some(old) => format!("{};{}", old, new),
        None => new.to_string(),
    };
    let rotate_at = now + SECRET_TIME;
    store.put(path, "secret", &value)?;
    store.put(path, "secretexpiry", &rotate_at.to_string())?;
    Ok(rotate_at)
}

impl Secret {
    /// Restore the stored secret, rotating or regenerating it when stale
    pub fn load(store: &dyn KvStore, path: &str, now: u64) -> Result<Self> {
        let expiry: Option<u64> = store
            .get(path, "secretexpiry")
            .and_then(|v| v.trim().parse().ok());
        let stored = store.get(path, "secret").unwrap_or_default();
        let current = stored.rsplit(';').next().unwrap_or("").to_string();

        let mut keep = None;
        let mut last = None;
        if let Some(expired) = expiry {
            if current.is_empty() {
                // nothing usable, regenerate
            } else if now < expired {
                keep = Some(expired.min(now + SECRET_TIME));
            } else if now < expired + SECRET_TIME {
                last = Some(current.clone());
            }
        }

        if let Some(rotate_at) = keep {
            log::debug!("Reusing stored secret until {}", rotate_at);
            return Ok(Self { current, rotate_at });
        }
        let fresh = build_secret()?;
        let rotate_at = save(store, path, &fresh, last.as_deref(), now)?;
        log::debug!("Generated new secret");
        Ok(Self {
            current: fresh,
            rotate_at,
        })
    }

    /// Rotate when due. Returns whether a new secret was generated.
    pub fn check(&mut self, store: &dyn KvStore, path: &str, now: u64) -> Result<bool> {
        if now < self.rotate_at {
            return Ok(false);
        }
        let fresh = build_secret()?;
        self.rotate_at = save(store, path, &fresh, Some(&self.current), now)?;
        self.current = fresh;
        log::debug!("Rotated secret");
        Ok(true)
    }
}
