use uuid::Uuid;

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone, Default)]
pub enum Priority {
	Low = 0x0002,
	#[default]
	Medium = 0x0000,
	High = 0x0001,
}

/// Root of the UUID-derived UID namespace.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part05/sect_B.2.html>
const UUID_UID_ROOT: &str = "2.25";

/// Generates a new globally unique UID from a random UUID represented as a single integer
/// value under the 2.25 root.
pub fn generate_uid() -> UI {
	format!("{UUID_UID_ROOT}.{}", Uuid::new_v4().as_u128())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generated_uids_fit_the_ui_value_representation() {
		let uid = generate_uid();
		assert!(uid.starts_with("2.25."));
		assert!(uid.len() <= 64);
		assert!(uid.chars().all(|c| c.is_ascii_digit() || c == '.'));
	}

	#[test]
	fn generated_uids_are_unique() {
		assert_ne!(generate_uid(), generate_uid());
	}
}
