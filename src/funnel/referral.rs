//! Referral code derivation and issuance.
//!
//! Codes look like `DR` + four letters of the contact's name + a four-digit
//! disambiguator, e.g. `DRALIK0427`. The store holds a unique index on the
//! code; a collision is reported as a constraint violation and triggers one
//! re-derivation with a random disambiguator.

use rand::Rng;

use crate::contacts::Contact;
use crate::error::{DatabaseError, FunnelError};
use crate::store::Database;

/// Letters used when the name has nothing usable.
const FALLBACK_STEM: &str = "DOC";

/// Derive a referral code from a display name and a disambiguator.
///
/// Only the last four decimal digits of `disambiguator` are used.
pub fn derive_referral_code(name: &str, disambiguator: u64) -> String {
    let trimmed = name.trim();
    let without_title = strip_title(trimmed);

    let stem: String = without_title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .take(4)
        .collect();
    let stem = if stem.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        stem
    };

    format!("DR{stem}{:04}", disambiguator % 10_000)
}

/// Shareable link for a code under `base_url`.
pub fn referral_link(base_url: &str, code: &str) -> String {
    format!("{}?ref={code}", base_url.trim_end_matches('/'))
}

/// First disambiguator for a contact: the tail of its creation timestamp.
pub fn initial_disambiguator(contact: &Contact) -> u64 {
    contact.created_at.timestamp_millis().rem_euclid(10_000) as u64
}

fn strip_title(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    for prefix in ["dr.", "dr "] {
        if lower.starts_with(prefix) {
            return name[prefix.len()..].trim_start();
        }
    }
    name
}

/// A referral code bound to a contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedReferral {
    pub code: String,
    pub link: String,
    /// The contact already had this code before the call.
    pub reused: bool,
}

/// Make sure `contact` has a referral code, reserving a new one if needed.
///
/// Idempotent: a contact that already holds a code gets the same code and
/// link back. New codes are persisted before they are returned.
pub async fn issue_referral(
    store: &dyn Database,
    contact: &Contact,
    base_url: &str,
) -> Result<IssuedReferral, FunnelError> {
    if let Some(code) = &contact.referral.code {
        return Ok(IssuedReferral {
            link: contact
                .referral
                .link
                .clone()
                .unwrap_or_else(|| referral_link(base_url, code)),
            code: code.clone(),
            reused: true,
        });
    }

    let name = contact.profile.display_name();
    let first = derive_referral_code(name, initial_disambiguator(contact));

    match try_reserve(store, contact, &first, base_url).await? {
        Some(issued) => Ok(issued),
        None => {
            let initial = initial_disambiguator(contact);
            let mut retry_salt: u64 = rand::thread_rng().gen_range(0..10_000);
            if retry_salt == initial {
                retry_salt = (retry_salt + 1) % 10_000;
            }
            let second = derive_referral_code(name, retry_salt);
            tracing::warn!(
                address = %contact.address,
                collided = %first,
                retry = %second,
                "Referral code collision, re-deriving"
            );
            try_reserve(store, contact, &second, base_url)
                .await?
                .ok_or_else(|| FunnelError::ReferralCollision {
                    address: contact.address.clone(),
                    code: second,
                })
        }
    }
}

/// `Ok(None)` means the code collided with another contact's.
async fn try_reserve(
    store: &dyn Database,
    contact: &Contact,
    code: &str,
    base_url: &str,
) -> Result<Option<IssuedReferral>, FunnelError> {
    let link = referral_link(base_url, code);
    match store
        .reserve_referral_code(&contact.address, code, &link)
        .await
    {
        Ok(true) => Ok(Some(IssuedReferral {
            code: code.to_string(),
            link,
            reused: false,
        })),
        Ok(false) => {
            // Someone reserved a code for this contact first; use theirs.
            let current = store
                .get_contact(&contact.address)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "contact".into(),
                    id: contact.address.clone(),
                })?;
            match (current.referral.code, current.referral.link) {
                (Some(code), link) => Ok(Some(IssuedReferral {
                    link: link.unwrap_or_else(|| referral_link(base_url, &code)),
                    code,
                    reused: true,
                })),
                (None, _) => Err(FunnelError::ConcurrentUpdate {
                    address: contact.address.clone(),
                }),
            }
        }
        Err(DatabaseError::Constraint(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
