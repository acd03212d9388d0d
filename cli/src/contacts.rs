use crate::store::{self, KeyValueStore, EMAIL_KEY, PHONE_KEY};
use anyhow::{bail, Result};
use std::sync::Arc;

const LOCAL_PHONE_DIGITS: usize = 9;

/// Addresses captured from the user for completion notices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contacts {
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Contacts {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone.is_none()
    }
}

#[derive(Clone)]
pub struct ContactBook {
    store: Arc<dyn KeyValueStore>,
}

impl ContactBook {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Result<Contacts> {
        Ok(Contacts { email: self.read(EMAIL_KEY)?, phone: self.read(PHONE_KEY)? })
    }

    pub fn set_email(&self, email: &str) -> Result<()> {
        let email = email.trim();
        validate_email(email)?;
        store::write_json(self.store.as_ref(), EMAIL_KEY, email)
    }

    pub fn set_phone(&self, phone: &str) -> Result<()> {
        let digits = validate_local_phone(phone)?;
        store::write_json(self.store.as_ref(), PHONE_KEY, &digits)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(EMAIL_KEY)?;
        self.store.remove(PHONE_KEY)
    }

    // Older clients stored the bare string rather than its JSON encoding.
    fn read(&self, key: &str) -> Result<Option<String>> {
        let Some(raw) = self.store.get(key)? else {
            return Ok(None);
        };
        let value = serde_json::from_str::<String>(&raw).unwrap_or(raw);
        let value = value.trim().to_string();
        Ok((!value.is_empty()).then_some(value))
    }
}

pub fn validate_email(email: &str) -> Result<()> {
    let Some((local, domain)) = email.split_once('@') else {
        bail!("email address must contain '@'");
    };
    let domain_ok =
        domain.split('.').count() >= 2 && domain.split('.').all(|part| !part.is_empty());
    if local.is_empty() || !domain_ok || email.chars().any(char::is_whitespace) {
        bail!("{email:?} is not a valid email address");
    }
    Ok(())
}

/// Accepts a local mobile number (nine digits starting with 7) in any
/// punctuation and returns the bare digits.
pub fn validate_local_phone(phone: &str) -> Result<String> {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        bail!("Phone number is required");
    }
    if digits.len() != LOCAL_PHONE_DIGITS {
        bail!("Phone number must be exactly 9 digits (e.g., 760000000)");
    }
    if !digits.starts_with('7') {
        bail!("Phone number must start with 7");
    }
    Ok(digits)
}
