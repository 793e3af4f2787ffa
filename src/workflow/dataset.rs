//! Attribute access helpers for in-memory datasets.
//!
//! Sequence items are copied out, modified and written back as a whole, so a dataset is never
//! observed half-updated.

use crate::workflow::WorkflowError;
use chrono::{DateTime, Local};
use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, Length, PrimitiveValue, Tag, VR};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;

/// Reads a string attribute, trimming padding. Missing or non-textual attributes read as `""`.
pub fn read_str(obj: &InMemDicomObject, tag: Tag) -> String {
	obj.get(tag)
		.and_then(|element| element.to_str().ok())
		.map(|value| value.trim_end_matches(['\0', ' ']).trim_start().to_owned())
		.unwrap_or_default()
}

/// Reads the alphabetic component group of a person name.
pub fn read_person_name(obj: &InMemDicomObject, tag: Tag) -> String {
	let name = read_str(obj, tag);
	name.split('=').next().unwrap_or_default().trim().to_owned()
}

pub fn first_item(obj: &InMemDicomObject, tag: Tag) -> Option<&InMemDicomObject> {
	obj.get(tag)
		.and_then(InMemElement::items)
		.and_then(<[InMemDicomObject]>::first)
}

/// Copies the items of a sequence. Missing or non-sequence attributes yield no items.
pub fn items(obj: &InMemDicomObject, tag: Tag) -> Vec<InMemDicomObject> {
	obj.get(tag)
		.and_then(InMemElement::items)
		.map(<[InMemDicomObject]>::to_vec)
		.unwrap_or_default()
}

pub fn put_str(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
	obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

/// Writes a zero-length attribute.
pub fn put_empty(obj: &mut InMemDicomObject, tag: Tag, vr: VR) {
	obj.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
}

pub fn put_items(obj: &mut InMemDicomObject, tag: Tag, items: Vec<InMemDicomObject>) {
	obj.put(DataElement::new(
		tag,
		VR::SQ,
		DataSetSequence::new(items, Length::UNDEFINED),
	));
}

/// Applies `update` to item `index` of the sequence `tag` and writes the sequence back.
pub fn update_item<T>(
	obj: &mut InMemDicomObject,
	tag: Tag,
	index: usize,
	update: impl FnOnce(&mut InMemDicomObject) -> Result<T, WorkflowError>,
) -> Result<T, WorkflowError> {
	let mut sequence = items(obj, tag);
	let item = sequence
		.get_mut(index)
		.ok_or_else(|| WorkflowError::Dataset(format!("{tag} has no item at index {index}")))?;
	let result = update(item)?;
	put_items(obj, tag, sequence);
	Ok(result)
}

/// Date (DA) and time (TM) values of one moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamp {
	pub date: String,
	pub time: String,
	/// HHMM, used for procedure step end times.
	pub short_time: String,
}

impl Timestamp {
	pub fn now() -> Self {
		Self::from(Local::now())
	}
}

impl From<DateTime<Local>> for Timestamp {
	fn from(moment: DateTime<Local>) -> Self {
		Self {
			date: moment.format("%Y%m%d").to_string(),
			time: moment.format("%H%M%S").to_string(),
			short_time: moment.format("%H%M").to_string(),
		}
	}
}
