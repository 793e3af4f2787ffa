//! Relinking of structured objects (RT Structure Sets) to freshly aggregated images.
//!
//! Contour image references are paired with the acquired instances by position. The caller
//! guarantees that both lists are in the same order.

use crate::types::{generate_uid, UI};
use crate::workflow::dataset::{
	first_item, items, put_items, put_str, read_str, update_item, Timestamp,
};
use crate::workflow::model::{ProcedureStep, SeriesGroup};
use crate::workflow::WorkflowError;
use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use tracing::{debug, instrument};

/// Applies `update` to the RT Referenced Series item of the first referenced frame of reference.
pub(crate) fn update_referenced_series<T>(
	obj: &mut InMemDicomObject,
	update: impl FnOnce(&mut InMemDicomObject) -> Result<T, WorkflowError>,
) -> Result<T, WorkflowError> {
	update_item(obj, tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE, 0, |frame| {
		update_item(frame, tags::RT_REFERENCED_STUDY_SEQUENCE, 0, |study| {
			update_item(study, tags::RT_REFERENCED_SERIES_SEQUENCE, 0, update)
		})
	})
}

fn contour_images(obj: &InMemDicomObject) -> Vec<InMemDicomObject> {
	first_item(obj, tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE)
		.and_then(|frame| first_item(frame, tags::RT_REFERENCED_STUDY_SEQUENCE))
		.and_then(|study| first_item(study, tags::RT_REFERENCED_SERIES_SEQUENCE))
		.map(|series| items(series, tags::CONTOUR_IMAGE_SEQUENCE))
		.unwrap_or_default()
}

fn single_group(step: &ProcedureStep) -> Result<&SeriesGroup, WorkflowError> {
	match step.series_groups() {
		[group] => Ok(group),
		groups => Err(WorkflowError::Unsupported(format!(
			"structured objects can only reference one series, found {}",
			groups.len()
		))),
	}
}

/// Points the contour image references of `target` at the instances of the step's only series.
///
/// Entry `i` of the contour image list is replaced by member `i`. When the entry held the
/// placeholder at position `p`, the first contour image of ROI contour `p` is replaced too.
/// `target` is only modified when the whole rewrite succeeds.
#[instrument(skip_all)]
pub fn rewrite(
	target: &mut InMemDicomObject,
	step: &ProcedureStep,
	placeholder_uids: &[UI],
) -> Result<(), WorkflowError> {
	let group = single_group(step)?;
	let mut images = contour_images(target);
	if images.is_empty() {
		return Err(WorkflowError::Unsupported(String::from(
			"no ContourImageSequence to rewrite",
		)));
	}
	if images.len() != group.sop_instance_infos.len() {
		return Err(WorkflowError::LengthMismatch {
			instances: group.sop_instance_infos.len(),
			references: images.len(),
		});
	}

	let mut work = target.clone();
	let mut roi_contours = items(&work, tags::ROI_CONTOUR_SEQUENCE);
	let mut roi_changed = false;

	for (image, member) in images.iter_mut().zip(&group.sop_instance_infos) {
		let existing = read_str(image, tags::REFERENCED_SOP_INSTANCE_UID);
		if let Some(position) = placeholder_uids.iter().position(|uid| *uid == existing) {
			let roi = roi_contours
				.get_mut(position)
				.ok_or(WorkflowError::IndexOutOfRange(position))?;
			update_item(roi, tags::CONTOUR_SEQUENCE, 0, |contour| {
				update_item(contour, tags::CONTOUR_IMAGE_SEQUENCE, 0, |contour_image| {
					put_str(
						contour_image,
						tags::REFERENCED_SOP_INSTANCE_UID,
						VR::UI,
						&member.sop_instance_uid,
					);
					Ok(())
				})
			})?;
			roi_changed = true;
		}
		put_str(
			image,
			tags::REFERENCED_SOP_INSTANCE_UID,
			VR::UI,
			&member.sop_instance_uid,
		);
	}

	if roi_changed {
		put_items(&mut work, tags::ROI_CONTOUR_SEQUENCE, roi_contours);
	}
	update_referenced_series(&mut work, |series| {
		put_items(series, tags::CONTOUR_IMAGE_SEQUENCE, images);
		Ok(())
	})?;

	*target = work;
	debug!(references = group.sop_instance_infos.len(), "Rewrote contour image references");
	Ok(())
}

/// Gives a structured object a new identity inside the step's study and relinks it to the
/// step's only series. Returns the new dataset and its SOP Instance UID.
#[rustfmt::skip]
#[instrument(skip_all)]
pub fn prepare_structured(
	source: &InMemDicomObject,
	step: &ProcedureStep,
	placeholder_uids: &[UI],
) -> Result<(InMemDicomObject, UI), WorkflowError> {
	let mut ds = source.clone();
	rewrite(&mut ds, step, placeholder_uids)?;
	let group = single_group(step)?;

	let now = Timestamp::now();
	let sop_instance_uid = generate_uid();
	let frame_of_reference_uid = generate_uid();
	let item = &step.item;

	put_str(&mut ds, tags::INSTANCE_CREATION_DATE, VR::DA, &now.date);
	put_str(&mut ds, tags::INSTANCE_CREATION_TIME, VR::TM, &now.time);
	put_str(&mut ds, tags::SOP_INSTANCE_UID, VR::UI, &sop_instance_uid);
	put_str(&mut ds, tags::PATIENT_NAME, VR::PN, &item.patient_name);
	put_str(&mut ds, tags::PATIENT_ID, VR::LO, &item.patient_id);
	put_str(&mut ds, tags::PATIENT_BIRTH_DATE, VR::DA, &item.patient_birth_date);
	put_str(&mut ds, tags::PATIENT_SEX, VR::CS, &item.patient_sex);
	put_str(&mut ds, tags::STUDY_INSTANCE_UID, VR::UI, &item.study_instance_uid);
	put_str(&mut ds, tags::SERIES_INSTANCE_UID, VR::UI, &generate_uid());

	update_item(&mut ds, tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE, 0, |frame| {
		put_str(frame, tags::FRAME_OF_REFERENCE_UID, VR::UI, &frame_of_reference_uid);
		update_item(frame, tags::RT_REFERENCED_STUDY_SEQUENCE, 0, |study| {
			put_str(study, tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, &item.study_instance_uid);
			update_item(study, tags::RT_REFERENCED_SERIES_SEQUENCE, 0, |series| {
				put_str(series, tags::SERIES_INSTANCE_UID, VR::UI, &group.series_instance_uid);
				Ok(())
			})
		})
	})?;

	let rois: Vec<InMemDicomObject> = items(&ds, tags::STRUCTURE_SET_ROI_SEQUENCE)
		.into_iter()
		.map(|mut roi| {
			put_str(&mut roi, tags::REFERENCED_FRAME_OF_REFERENCE_UID, VR::UI, &frame_of_reference_uid);
			roi
		})
		.collect();
	if !rois.is_empty() {
		put_items(&mut ds, tags::STRUCTURE_SET_ROI_SEQUENCE, rois);
	}

	Ok((ds, sop_instance_uid))
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::workflow::model::SopInstanceInfo;
	use crate::workflow::template::tests::{snapshot, step};

	pub const PLACEHOLDERS: [&str; 3] = ["1.2.9.266", "1.2.9.264", "1.2.9.261"];

	pub fn placeholders() -> Vec<UI> {
		PLACEHOLDERS.iter().map(|uid| UI::from(*uid)).collect()
	}

	fn reference(uid: &str) -> InMemDicomObject {
		let mut item = InMemDicomObject::new_empty();
		put_str(&mut item, tags::REFERENCED_SOP_CLASS_UID, VR::UI, "1.2.840.10008.5.1.4.1.1.2");
		put_str(&mut item, tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, uid);
		item
	}

	fn roi_contour(uid: &str) -> InMemDicomObject {
		let mut contour = InMemDicomObject::new_empty();
		put_items(&mut contour, tags::CONTOUR_IMAGE_SEQUENCE, vec![reference(uid)]);
		let mut roi = InMemDicomObject::new_empty();
		put_items(&mut roi, tags::CONTOUR_SEQUENCE, vec![contour]);
		roi
	}

	/// An RT Structure Set referencing `references` with one ROI contour per placeholder.
	pub fn structure_set(references: &[&str]) -> InMemDicomObject {
		let mut series = InMemDicomObject::new_empty();
		put_str(&mut series, tags::SERIES_INSTANCE_UID, VR::UI, "1.2.9.1");
		put_items(
			&mut series,
			tags::CONTOUR_IMAGE_SEQUENCE,
			references.iter().map(|uid| reference(uid)).collect(),
		);
		let mut study = InMemDicomObject::new_empty();
		put_str(&mut study, tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, "1.2.9.0");
		put_items(&mut study, tags::RT_REFERENCED_SERIES_SEQUENCE, vec![series]);
		let mut frame = InMemDicomObject::new_empty();
		put_str(&mut frame, tags::FRAME_OF_REFERENCE_UID, VR::UI, "1.2.9.2");
		put_items(&mut frame, tags::RT_REFERENCED_STUDY_SEQUENCE, vec![study]);

		let mut roi = InMemDicomObject::new_empty();
		put_str(&mut roi, tags::REFERENCED_FRAME_OF_REFERENCE_UID, VR::UI, "1.2.9.2");

		let mut obj = InMemDicomObject::new_empty();
		put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, "1.2.840.10008.5.1.4.1.1.481.3");
		put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, "1.2.9.3");
		put_items(&mut obj, tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE, vec![frame]);
		put_items(&mut obj, tags::STRUCTURE_SET_ROI_SEQUENCE, vec![roi.clone(), roi]);
		put_items(
			&mut obj,
			tags::ROI_CONTOUR_SEQUENCE,
			PLACEHOLDERS.iter().map(|uid| roi_contour(uid)).collect(),
		);
		obj
	}

	pub fn step_with_groups(sizes: &[usize]) -> ProcedureStep {
		let mut step = step();
		step.sop_instance_uids = Some(
			sizes
				.iter()
				.map(|size| SeriesGroup {
					series_instance_uid: generate_uid(),
					sop_class_uid: UI::from("1.2.840.10008.5.1.4.1.1.2"),
					sop_instance_infos: (0..*size)
						.map(|index| SopInstanceInfo {
							sop_instance_uid: generate_uid(),
							path: format!("/acq/{index}.dcm"),
							sop_class_uid: UI::from("1.2.840.10008.5.1.4.1.1.2"),
						})
						.collect(),
				})
				.collect(),
		);
		step
	}

	fn roi_reference(obj: &InMemDicomObject, index: usize) -> String {
		let roi = &items(obj, tags::ROI_CONTOUR_SEQUENCE)[index];
		let contour = first_item(roi, tags::CONTOUR_SEQUENCE).unwrap();
		let image = first_item(contour, tags::CONTOUR_IMAGE_SEQUENCE).unwrap();
		read_str(image, tags::REFERENCED_SOP_INSTANCE_UID)
	}

	#[test]
	fn placeholders_are_relinked_by_position() {
		let mut target = structure_set(&[PLACEHOLDERS[1], "1.2.9.77", PLACEHOLDERS[0]]);
		let step = step_with_groups(&[3]);
		let members = &step.series_groups()[0].sop_instance_infos;

		rewrite(&mut target, &step, &placeholders()).unwrap();

		let references: Vec<String> = contour_images(&target)
			.iter()
			.map(|image| read_str(image, tags::REFERENCED_SOP_INSTANCE_UID))
			.collect();
		let expected: Vec<String> = members.iter().map(|m| m.sop_instance_uid.clone()).collect();
		assert_eq!(references, expected);

		assert_eq!(roi_reference(&target, 1), members[0].sop_instance_uid);
		assert_eq!(roi_reference(&target, 0), members[2].sop_instance_uid);
		assert_eq!(roi_reference(&target, 2), PLACEHOLDERS[2]);
	}

	#[test]
	fn several_series_are_unsupported_and_leave_target_alone() {
		let mut target = structure_set(&[PLACEHOLDERS[0], PLACEHOLDERS[1]]);
		let before = snapshot(&target, &[]);
		let result = rewrite(&mut target, &step_with_groups(&[1, 1]), &placeholders());
		assert!(matches!(result, Err(WorkflowError::Unsupported(_))));
		assert_eq!(snapshot(&target, &[]), before);
	}

	#[test]
	fn missing_contour_images_are_unsupported() {
		let mut target = InMemDicomObject::new_empty();
		let result = rewrite(&mut target, &step_with_groups(&[1]), &placeholders());
		assert!(matches!(result, Err(WorkflowError::Unsupported(_))));
	}

	#[test]
	fn count_mismatch_is_rejected() {
		let mut target = structure_set(&[PLACEHOLDERS[0]]);
		let result = rewrite(&mut target, &step_with_groups(&[2]), &placeholders());
		assert!(matches!(
			result,
			Err(WorkflowError::LengthMismatch { instances: 2, references: 1 })
		));
	}

	#[test]
	fn short_roi_contour_list_fails_without_mutation() {
		let mut target = structure_set(&["1.2.9.77", PLACEHOLDERS[2]]);
		let mut rois = items(&target, tags::ROI_CONTOUR_SEQUENCE);
		rois.truncate(1);
		put_items(&mut target, tags::ROI_CONTOUR_SEQUENCE, rois);
		let before = snapshot(&target, &[]);

		let result = rewrite(&mut target, &step_with_groups(&[2]), &placeholders());

		assert!(matches!(result, Err(WorkflowError::IndexOutOfRange(2))));
		assert_eq!(snapshot(&target, &[]), before);
	}

	#[test]
	fn structured_object_gets_new_identity() {
		let source = structure_set(&[PLACEHOLDERS[0]]);
		let step = step_with_groups(&[1]);
		let (ds, sop_instance_uid) = prepare_structured(&source, &step, &placeholders()).unwrap();

		assert_eq!(read_str(&ds, tags::SOP_INSTANCE_UID), sop_instance_uid);
		assert_ne!(sop_instance_uid, "1.2.9.3");
		assert_eq!(read_str(&ds, tags::PATIENT_ID), "P1");
		assert_eq!(read_str(&ds, tags::STUDY_INSTANCE_UID), "1.2.3.4");

		let frame = first_item(&ds, tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE).unwrap();
		let frame_uid = read_str(frame, tags::FRAME_OF_REFERENCE_UID);
		assert_ne!(frame_uid, "1.2.9.2");
		for roi in items(&ds, tags::STRUCTURE_SET_ROI_SEQUENCE) {
			assert_eq!(read_str(&roi, tags::REFERENCED_FRAME_OF_REFERENCE_UID), frame_uid);
		}
		let study = first_item(frame, tags::RT_REFERENCED_STUDY_SEQUENCE).unwrap();
		assert_eq!(read_str(study, tags::REFERENCED_SOP_INSTANCE_UID), "1.2.3.4");
		let series = first_item(study, tags::RT_REFERENCED_SERIES_SEQUENCE).unwrap();
		assert_eq!(
			read_str(series, tags::SERIES_INSTANCE_UID),
			step.series_groups()[0].series_instance_uid
		);
	}
}
