//! Patch-level labels derived from ground-truth masks.

use crate::error::{OcnnError, Result};
use crate::patch::Patch;

/// Label of a normal patch.
pub const NORMAL: u8 = 0;

/// Label of an anomalous patch.
pub const ANOMALOUS: u8 = 1;

/// `1` if any pixel of the mask patch is non-zero, else `0`.
#[must_use]
pub fn patch_label(mask_patch: &Patch) -> u8 {
    if mask_patch.has_positive_pixel() {
        ANOMALOUS
    } else {
        NORMAL
    }
}

/// Labels for a stream of mask patches, in order.
#[must_use]
pub fn patch_labels(mask_patches: &[Patch]) -> Vec<u8> {
    mask_patches.iter().map(patch_label).collect()
}

/// Drop leading normal items so that normal and anomalous counts match.
///
/// With `A` anomalous items out of `N`, the first `N - 2A` normal items (in
/// stream order) are removed, leaving `A` anomalous and `A` normal items.
/// When `N <= 2A` nothing needs removing, but a stream that starts with a
/// normal item still loses that first item. Relative order of the survivors
/// is preserved.
///
/// # Errors
///
/// Returns [`OcnnError::LabelAlignment`] if `items` and `labels` differ in
/// length.
pub fn balance_normal_patches<T>(items: Vec<T>, labels: Vec<u8>) -> Result<(Vec<T>, Vec<u8>)> {
    if items.len() != labels.len() {
        return Err(OcnnError::label_alignment(format!(
            "{} items but {} labels",
            items.len(),
            labels.len()
        )));
    }

    let anomalous = labels.iter().filter(|&&l| l == ANOMALOUS).count();
    let excess = labels.len().saturating_sub(2 * anomalous);
    let mut to_remove = match labels.first() {
        Some(&NORMAL) if excess == 0 => 1,
        _ => excess,
    };

    let mut kept_items = Vec::with_capacity(items.len() - to_remove);
    let mut kept_labels = Vec::with_capacity(items.len() - to_remove);
    for (item, label) in items.into_iter().zip(labels) {
        if label == NORMAL && to_remove > 0 {
            to_remove -= 1;
            continue;
        }
        kept_items.push(item);
        kept_labels.push(label);
    }
    Ok((kept_items, kept_labels))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_patch(hot_pixel: Option<usize>, value: f32) -> Patch {
        let mut data = vec![0.0; 4 * 4 * 3];
        if let Some(index) = hot_pixel {
            data[index] = value;
        }
        Patch::new(4, data).unwrap()
    }

    #[test]
    fn test_all_zero_patch_is_normal() {
        assert_eq!(patch_label(&mask_patch(None, 0.0)), NORMAL);
    }

    #[test]
    fn test_single_hot_pixel_is_anomalous() {
        // one pixel at 255 -> 1.0 after scaling
        assert_eq!(patch_label(&mask_patch(Some(17), 1.0)), ANOMALOUS);
        assert_eq!(patch_label(&mask_patch(Some(47), 1.0 / 255.0)), ANOMALOUS);
    }

    #[test]
    fn test_patch_labels_in_order() {
        let patches = vec![
            mask_patch(None, 0.0),
            mask_patch(Some(0), 1.0),
            mask_patch(None, 0.0),
        ];
        assert_eq!(patch_labels(&patches), vec![0, 1, 0]);
    }

    #[test]
    fn test_balance_keeps_equal_counts() {
        let items: Vec<usize> = (0..10).collect();
        let labels = vec![0, 0, 1, 0, 0, 0, 1, 0, 0, 0];
        let (items, labels) = balance_normal_patches(items, labels).unwrap();

        // 10 - 2*2 = 6 leading normals removed: 0, 1, 3, 4, 5, 7
        assert_eq!(items, vec![2, 6, 8, 9]);
        assert_eq!(labels, vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_balance_noop_when_anomalies_dominate() {
        let items = vec!['a', 'b', 'c'];
        let labels = vec![1, 1, 0];
        let (items, labels) = balance_normal_patches(items, labels).unwrap();
        assert_eq!(items, vec!['a', 'b', 'c']);
        assert_eq!(labels, vec![1, 1, 0]);
    }

    #[test]
    fn test_balance_drops_leading_normal_when_anomalies_dominate() {
        // 4 - 2*2 = 0 excess normals, but the first item is normal
        let items = vec!['a', 'b', 'c', 'd'];
        let labels = vec![0, 1, 0, 1];
        let (items, labels) = balance_normal_patches(items, labels).unwrap();
        assert_eq!(items, vec!['b', 'c', 'd']);
        assert_eq!(labels, vec![1, 0, 1]);

        let (items, _) = balance_normal_patches(vec![7], vec![0]).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn test_balance_all_normal_removes_everything() {
        let (items, labels) = balance_normal_patches(vec![1, 2, 3], vec![0, 0, 0]).unwrap();
        assert!(items.is_empty());
        assert!(labels.is_empty());
    }

    #[test]
    fn test_balance_length_mismatch() {
        assert!(matches!(
            balance_normal_patches(vec![1, 2], vec![0]),
            Err(OcnnError::LabelAlignment { .. })
        ));
    }
}
