//! Recipient normalization into the protocol's canonical address form.

use crate::config::RecipientRules;
use crate::error::{GateError, Result};

/// Normalizes `raw` into `digits@suffix`.
///
/// Accepts free-form phone input (spaces, punctuation, an existing canonical
/// address, or the `me` sentinel for the session's own identity), applies the
/// configured leading-digit correction, and validates the digit count.
/// Idempotent over its own output.
pub fn normalize(raw: &str, own_identity: Option<&str>, rules: &RecipientRules) -> Result<String> {
	let trimmed = raw.trim();
	if trimmed.eq_ignore_ascii_case("me") {
		let identity = own_identity.ok_or_else(|| GateError::InvalidRecipient("own identity not yet known".to_string()))?;
		return normalize(identity, None, rules);
	}

	let suffix_marker = format!("@{}", rules.suffix);
	let candidate = trimmed.strip_suffix(&suffix_marker).unwrap_or(trimmed);

	let mut digits: String = candidate.chars().filter(char::is_ascii_digit).collect();
	if digits.is_empty() {
		return Err(GateError::InvalidRecipient(format!("no digits in {raw:?}")));
	}

	if let Some(rewrite) = &rules.rewrite {
		if digits.len() == rewrite.len && digits.starts_with(rewrite.prefix) {
			digits.replace_range(0..1, &rewrite.replacement.to_string());
		}
	}

	let count = digits.len();
	if count < rules.min_digits || count > rules.max_digits {
		return Err(GateError::InvalidRecipient(format!("{raw:?} resolves to {count} digits")));
	}

	Ok(format!("{digits}{suffix_marker}"))
}
