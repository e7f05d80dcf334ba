/// Axis-aligned box in frame pixel coordinates, `[x1, y1, x2, y2]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from centre/size floats as emitted by YOLO heads.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: (cx - w / 2.0).round() as i32,
            y1: (cy - h / 2.0).round() as i32,
            x2: (cx + w / 2.0).round() as i32,
            y2: (cy + h / 2.0).round() as i32,
        }
    }

    pub fn area(&self) -> i64 {
        let w = (self.x2 - self.x1).max(0) as i64;
        let h = (self.y2 - self.y1).max(0) as i64;
        w * h
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = BoundingBox::new(ix1, iy1, ix2, iy2).area();
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }
}

/// One detector output.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Score in `0.0..=1.0`.
    pub confidence: f32,
    /// Raw class id from the model head.
    pub class_id: i32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, class_id: i32) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
        }
    }

    pub fn class(&self) -> FallClass {
        FallClass::from_class_id(self.class_id)
    }
}

/// Semantic class of a detection. The model is trained with id 0 = fall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallClass {
    Fall,
    NonFall,
}

impl FallClass {
    pub fn from_class_id(class_id: i32) -> Self {
        if class_id == 0 {
            FallClass::Fall
        } else {
            FallClass::NonFall
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FallClass::Fall => "fall",
            FallClass::NonFall => "nonfall",
        }
    }
}

/// Class-aware greedy non-maximum suppression.
///
/// Keeps the highest-scoring box of each overlapping cluster (IoU above
/// `iou_threshold`) within the same class id.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let overlaps = kept
            .iter()
            .any(|k| k.class_id == det.class_id && k.bbox.iou(&det.bbox) > iou_threshold);
        if !overlaps {
            kept.push(det);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_zero_is_fall() {
        assert_eq!(FallClass::from_class_id(0), FallClass::Fall);
        assert_eq!(FallClass::from_class_id(1), FallClass::NonFall);
        assert_eq!(FallClass::from_class_id(7), FallClass::NonFall);
        assert_eq!(FallClass::Fall.label(), "fall");
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox::new(0, 0, 10, 10);
        assert!((b.iou(&b) - 1.0).abs() < f32::EPSILON);
        assert_eq!(b.iou(&BoundingBox::new(20, 20, 30, 30)), 0.0);
    }

    #[test]
    fn nms_keeps_best_per_class() {
        let dets = vec![
            Detection::new(BoundingBox::new(0, 0, 10, 10), 0.6, 0),
            Detection::new(BoundingBox::new(1, 1, 11, 11), 0.9, 0),
            // Same place, other class: survives.
            Detection::new(BoundingBox::new(0, 0, 10, 10), 0.5, 1),
        ];
        let kept = non_max_suppression(dets, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 1);
    }
}
