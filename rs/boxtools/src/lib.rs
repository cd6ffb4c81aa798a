//! Box utilities for region-based detectors.
//!
//! This crate provides:
//! - Corner-format boxes `[ymin, xmin, ymax, xmax]` and their IoU
//! - A `Detection` record (box, score, 1-based class id)
//! - Greedy single-class and class-wise non-max suppression

use std::cmp::Ordering;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Options for class-wise non-max suppression.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NmsOptions {
    /// Boxes overlapping a kept box by more than this IoU are suppressed.
    pub iou_threshold: f32,
    /// Scores below this value never become detections.
    pub score_threshold: f32,
    /// Maximum number of boxes kept for a single class.
    pub max_detections_per_class: usize,
    /// Maximum number of boxes kept for an image, across classes.
    pub max_total_detections: usize,
}

impl Default for NmsOptions {
    fn default() -> Self {
        Self {
            iou_threshold: 0.5,
            score_threshold: 0.0001,
            max_detections_per_class: 100,
            max_total_detections: 300,
        }
    }
}

/// A single detection produced by suppression.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Box in `[ymin, xmin, ymax, xmax]` format.
    pub bbox: [f32; 4],
    pub score: f32,
    /// 1-based class id, 0 is reserved for background.
    pub class_id: usize,
}

impl Detection {
    pub fn new(bbox: [f32; 4], score: f32, class_id: usize) -> Self {
        Self {
            bbox,
            score,
            class_id,
        }
    }

    pub fn height(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn width(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }

    pub fn area(&self) -> f32 {
        area(self.bbox)
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Detection {{ class_id: {}, score: {:.3}, bbox: [{:.3}, {:.3}, {:.3}, {:.3}] }}",
            self.class_id, self.score, self.bbox[0], self.bbox[1], self.bbox[2], self.bbox[3]
        )
    }
}

/// Area of a corner-format box, zero for degenerate boxes.
pub fn area(bbox: [f32; 4]) -> f32 {
    let [ymin, xmin, ymax, xmax] = bbox;
    (ymax - ymin).max(0.0) * (xmax - xmin).max(0.0)
}

/// Compute IoU between two boxes in corner format.
pub fn iou(box1: [f32; 4], box2: [f32; 4]) -> f32 {
    let [y1_min, x1_min, y1_max, x1_max] = box1;
    let [y2_min, x2_min, y2_max, x2_max] = box2;

    let inter_h = (y1_max.min(y2_max) - y1_min.max(y2_min)).max(0.0);
    let inter_w = (x1_max.min(x2_max) - x1_min.max(x2_min)).max(0.0);
    let inter_area = inter_h * inter_w;

    let union_area = area(box1) + area(box2) - inter_area;
    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

fn by_score_desc(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Greedy non-max suppression over a single class.
///
/// Returns indices into `boxes`, highest score first. Boxes scoring below
/// `score_threshold` are dropped before suppression.
pub fn non_max_suppression(
    boxes: &[[f32; 4]],
    scores: &[f32],
    iou_threshold: f32,
    score_threshold: f32,
    max_output: usize,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len().min(scores.len()))
        .filter(|&i| scores[i] >= score_threshold)
        .collect();
    order.sort_by(|&a, &b| by_score_desc(scores[a], scores[b]));

    let mut keep: Vec<usize> = Vec::new();
    for i in order {
        if keep.len() >= max_output {
            break;
        }
        let suppressed = keep
            .iter()
            .any(|&k| iou(boxes[k], boxes[i]) > iou_threshold);
        if !suppressed {
            keep.push(i);
        }
    }
    keep
}

/// Class-wise non-max suppression for one image.
///
/// `scores[r][c]` is the score of region `r` for foreground class `c`
/// (0-based); returned detections carry 1-based class ids and are sorted by
/// score, truncated to `max_total_detections`.
pub fn multiclass_non_max_suppression(
    boxes: &[[f32; 4]],
    scores: &[Vec<f32>],
    options: &NmsOptions,
) -> Vec<Detection> {
    let num_classes = scores.first().map(|row| row.len()).unwrap_or(0);
    let mut detections = Vec::new();

    for class in 0..num_classes {
        let class_scores: Vec<f32> = scores.iter().map(|row| row[class]).collect();
        let keep = non_max_suppression(
            boxes,
            &class_scores,
            options.iou_threshold,
            options.score_threshold,
            options.max_detections_per_class,
        );
        detections.extend(
            keep.into_iter()
                .map(|i| Detection::new(boxes[i], class_scores[i], class + 1)),
        );
    }

    detections.sort_by(|a, b| by_score_desc(a.score, b.score));
    detections.truncate(options.max_total_detections);
    detections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou() {
        // Perfect overlap
        let box1 = [0.0, 0.0, 10.0, 10.0];
        assert!((iou(box1, box1) - 1.0).abs() < 1e-6);

        // No overlap
        let box2 = [20.0, 20.0, 30.0, 30.0];
        assert!(iou(box1, box2).abs() < 1e-6);

        // Intersection: 5x10=50, Union: 100+100-50=150
        let box3 = [0.0, 5.0, 10.0, 15.0];
        assert!((iou(box1, box3) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_degenerate() {
        let empty = [0.5, 0.5, 0.5, 0.5];
        assert_eq!(iou(empty, empty), 0.0);
    }

    #[test]
    fn test_detection_dimensions() {
        let det = Detection::new([0.1, 0.2, 0.5, 0.7], 0.9, 1);
        assert!((det.height() - 0.4).abs() < 1e-6);
        assert!((det.width() - 0.5).abs() < 1e-6);
        assert!((det.area() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let boxes = [
            [0.0, 0.0, 1.0, 1.0],
            [0.0, 0.0, 1.0, 0.9],
            [2.0, 2.0, 3.0, 3.0],
        ];
        let scores = [0.8, 0.9, 0.3];
        let keep = non_max_suppression(&boxes, &scores, 0.5, 0.0, 10);
        assert_eq!(keep, vec![1, 2]);
    }

    #[test]
    fn test_nms_score_threshold_and_limit() {
        let boxes = [
            [0.0, 0.0, 1.0, 1.0],
            [2.0, 2.0, 3.0, 3.0],
            [4.0, 4.0, 5.0, 5.0],
        ];
        let scores = [0.8, 0.05, 0.6];
        assert_eq!(non_max_suppression(&boxes, &scores, 0.5, 0.1, 10), vec![0, 2]);
        assert_eq!(non_max_suppression(&boxes, &scores, 0.5, 0.0, 1), vec![0]);
    }

    #[test]
    fn test_multiclass_nms() {
        let boxes = [[0.0, 0.0, 1.0, 1.0], [0.0, 0.0, 1.0, 0.95]];
        let scores = vec![vec![0.9, 0.1], vec![0.7, 0.6]];
        let options = NmsOptions {
            iou_threshold: 0.5,
            score_threshold: 0.2,
            max_detections_per_class: 10,
            max_total_detections: 10,
        };
        let detections = multiclass_non_max_suppression(&boxes, &scores, &options);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_id, 1);
        assert_eq!(detections[0].score, 0.9);
        assert_eq!(detections[1].class_id, 2);
        assert_eq!(detections[1].score, 0.6);
    }

    #[test]
    fn test_multiclass_nms_empty() {
        let detections = multiclass_non_max_suppression(&[], &[], &NmsOptions::default());
        assert!(detections.is_empty());
    }
}
