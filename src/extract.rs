use serde_json::Value;

pub const NUM_KEYPOINTS: usize = 17;

/// Fallback image size when a frame carries no coordinates at all.
const DEFAULT_IMAGE_W: f32 = 640.0;
const DEFAULT_IMAGE_H: f32 = 480.0;

/// A single 2D joint with detector confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    pub fn is_valid(&self, threshold: f32) -> bool {
        self.confidence >= threshold && self.x.is_finite() && self.y.is_finite()
    }
}

/// The primary subject of one frame: its bounding box (xyxy), up to 17
/// keypoints, and the (possibly inferred) image dimensions.
#[derive(Debug, Clone)]
pub struct PoseFrame {
    pub bbox: Option<[f32; 4]>,
    pub keypoints: Vec<Keypoint>,
    pub image_w: f32,
    pub image_h: f32,
}

#[derive(Debug, Clone)]
pub struct ObjectDetection {
    pub class_name: String,
    pub bbox: [f32; 4],
}

fn value_f32(v: &Value) -> Option<f32> {
    v.as_f64().map(|f| f as f32)
}

fn field_f32(map: &Value, key: &str) -> Option<f32> {
    map.get(key).and_then(value_f32)
}

/// Normalize any of the accepted bbox encodings to xyxy: a 4-element array,
/// `{cx, cy, w, h}` or `{x, y, w, h}`.
pub fn bbox_xyxy_from_any(value: &Value) -> Option<[f32; 4]> {
    if let Some(items) = value.as_array() {
        if items.len() == 4 {
            let mut out = [0.0f32; 4];
            for (slot, item) in out.iter_mut().zip(items) {
                *slot = value_f32(item)?;
            }
            return Some(out);
        }
        return None;
    }
    if value.is_object() {
        if let (Some(cx), Some(cy), Some(w), Some(h)) = (
            field_f32(value, "cx"),
            field_f32(value, "cy"),
            field_f32(value, "w"),
            field_f32(value, "h"),
        ) {
            return Some([cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]);
        }
        if let (Some(x), Some(y), Some(w), Some(h)) = (
            field_f32(value, "x"),
            field_f32(value, "y"),
            field_f32(value, "w"),
            field_f32(value, "h"),
        ) {
            return Some([x, y, x + w, y + h]);
        }
    }
    None
}

/// Parse one keypoint entry: `[x, y]`, `[x, y, conf]`, or
/// `{x, y, conf|confidence}`. Missing confidence defaults to 1.0.
fn parse_keypoint(value: &Value) -> Option<Keypoint> {
    if let Some(items) = value.as_array() {
        if items.len() >= 2 {
            let x = value_f32(&items[0])?;
            let y = value_f32(&items[1])?;
            let conf = items.get(2).and_then(value_f32).unwrap_or(1.0);
            return Some(Keypoint::new(x, y, conf));
        }
        return None;
    }
    if value.is_object() {
        let x = field_f32(value, "x")?;
        let y = field_f32(value, "y")?;
        let conf = field_f32(value, "conf")
            .or_else(|| field_f32(value, "confidence"))
            .unwrap_or(1.0);
        return Some(Keypoint::new(x, y, conf));
    }
    None
}

fn parse_keypoint_group(value: &Value) -> Vec<Keypoint> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .take(NUM_KEYPOINTS)
                .filter_map(parse_keypoint)
                .collect()
        })
        .unwrap_or_default()
}

/// Index of the largest box among `boxes`, ties broken by first occurrence.
fn largest_box_index(boxes: &[Value]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, value) in boxes.iter().enumerate() {
        let Some([x1, y1, x2, y2]) = bbox_xyxy_from_any(value) else {
            continue;
        };
        let area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if best.map(|(_, a)| area > a).unwrap_or(true) {
            best = Some((i, area));
        }
    }
    best.map(|(i, _)| i)
}

/// Extract the primary subject from a raw pose record.
///
/// Two record shapes are supported: the `persons` form (per-person objects
/// with `score`, `bbox`, `keypoints` and an explicit `image_size`), and the
/// parallel-arrays form (`boxes` + `keypoints`, subject = largest box, its
/// keypoint group selected by index). Image dimensions fall back to the
/// maximum coordinate observed anywhere in the frame.
pub fn extract_pose(record: &Value) -> PoseFrame {
    if let Some(persons) = record.get("persons").and_then(Value::as_array) {
        if !persons.is_empty() {
            let person = persons
                .iter()
                .max_by(|a, b| {
                    let sa = field_f32(a, "score").unwrap_or(0.0);
                    let sb = field_f32(b, "score").unwrap_or(0.0);
                    sa.total_cmp(&sb)
                })
                .unwrap_or(&persons[0]);
            let bbox = person.get("bbox").and_then(bbox_xyxy_from_any);
            let keypoints = person
                .get("keypoints")
                .map(parse_keypoint_group)
                .unwrap_or_default();
            let size = record.get("image_size");
            let image_w = size.and_then(|s| field_f32(s, "width")).unwrap_or(1.0).max(1.0);
            let image_h = size.and_then(|s| field_f32(s, "height")).unwrap_or(1.0).max(1.0);
            return PoseFrame { bbox, keypoints, image_w, image_h };
        }
    }

    let boxes: Vec<Value> = record
        .get("boxes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let groups: Vec<Value> = record
        .get("keypoints")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let best = largest_box_index(&boxes);
    let bbox = best.and_then(|i| bbox_xyxy_from_any(&boxes[i]));
    let keypoints = best
        .and_then(|i| groups.get(i))
        .or_else(|| groups.first())
        .map(parse_keypoint_group)
        .unwrap_or_default();

    let (image_w, image_h) = infer_image_size(&boxes, &groups);
    PoseFrame { bbox, keypoints, image_w, image_h }
}

/// Largest x/y seen across all boxes and keypoint groups, with a floor of
/// 1.0; defaults when the frame has no coordinates at all.
fn infer_image_size(boxes: &[Value], groups: &[Value]) -> (f32, f32) {
    let mut max_x: Option<f32> = None;
    let mut max_y: Option<f32> = None;
    let mut push = |x: f32, y: f32| {
        max_x = Some(max_x.map_or(x, |m| m.max(x)));
        max_y = Some(max_y.map_or(y, |m| m.max(y)));
    };
    for value in boxes {
        if let Some([x1, y1, x2, y2]) = bbox_xyxy_from_any(value) {
            push(x1, y1);
            push(x2, y2);
        }
    }
    for group in groups {
        for kp in parse_keypoint_group(group) {
            push(kp.x, kp.y);
        }
    }
    (
        max_x.map_or(DEFAULT_IMAGE_W, |m| m.max(1.0)),
        max_y.map_or(DEFAULT_IMAGE_H, |m| m.max(1.0)),
    )
}

/// Normalize a record's detection list to `{class_name, bbox}` pairs.
/// Entries missing either field are discarded.
pub fn extract_objects(record: &Value) -> Vec<ObjectDetection> {
    let list = ["objects", "detections", "boxes", "bboxes", "predictions"]
        .iter()
        .find_map(|key| record.get(*key).and_then(Value::as_array));
    let Some(list) = list else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for det in list {
        if !det.is_object() {
            continue;
        }
        let name = ["cls_name", "class_name", "name", "label"]
            .iter()
            .find_map(|key| det.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let bbox = ["bbox", "xyxy", "box", "bbox_xyxy"]
            .iter()
            .find_map(|key| det.get(*key).and_then(bbox_xyxy_from_any));
        if let (Some(name), Some(bbox)) = (name, bbox) {
            out.push(ObjectDetection { class_name: name.to_string(), bbox });
        }
    }
    out
}

/// Completeness test for one frame: a bounding box when required, and at
/// least `kp_min` joints at or above the confidence threshold.
pub fn has_full_skeleton(
    frame: &PoseFrame,
    kp_min: usize,
    bbox_required: bool,
    conf_threshold: f32,
) -> bool {
    if bbox_required && frame.bbox.is_none() {
        return false;
    }
    let valid = frame
        .keypoints
        .iter()
        .filter(|kp| kp.is_valid(conf_threshold))
        .count();
    valid >= kp_min
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_frame_record(conf: f64) -> Value {
        let kps: Vec<Vec<f64>> = (0..17).map(|i| vec![10.0 + i as f64, 20.0, conf]).collect();
        json!({
            "boxes": [[5.0, 5.0, 100.0, 200.0]],
            "keypoints": [kps],
        })
    }

    #[test]
    fn test_bbox_from_any_forms() {
        assert_eq!(
            bbox_xyxy_from_any(&json!([1.0, 2.0, 3.0, 4.0])),
            Some([1.0, 2.0, 3.0, 4.0])
        );
        assert_eq!(
            bbox_xyxy_from_any(&json!({"cx": 5.0, "cy": 5.0, "w": 2.0, "h": 4.0})),
            Some([4.0, 3.0, 6.0, 7.0])
        );
        assert_eq!(
            bbox_xyxy_from_any(&json!({"x": 1.0, "y": 2.0, "w": 3.0, "h": 4.0})),
            Some([1.0, 2.0, 4.0, 6.0])
        );
        assert_eq!(bbox_xyxy_from_any(&json!([1.0, 2.0])), None);
    }

    #[test]
    fn test_primary_subject_is_largest_box() {
        let record = json!({
            "boxes": [[0.0, 0.0, 10.0, 10.0], [0.0, 0.0, 50.0, 50.0]],
            "keypoints": [
                [[1.0, 1.0]],
                [[2.0, 2.0]]
            ],
        });
        let frame = extract_pose(&record);
        assert_eq!(frame.bbox, Some([0.0, 0.0, 50.0, 50.0]));
        assert_eq!(frame.keypoints[0].x, 2.0);
    }

    #[test]
    fn test_largest_box_tie_breaks_first() {
        let boxes = vec![json!([0.0, 0.0, 10.0, 10.0]), json!([5.0, 5.0, 15.0, 15.0])];
        assert_eq!(largest_box_index(&boxes), Some(0));
    }

    #[test]
    fn test_image_size_inferred_from_coordinates() {
        let frame = extract_pose(&full_frame_record(1.0));
        assert_eq!(frame.image_w, 100.0);
        assert_eq!(frame.image_h, 200.0);
    }

    #[test]
    fn test_image_size_defaults_when_empty() {
        let frame = extract_pose(&json!({"boxes": [], "keypoints": []}));
        assert_eq!(frame.image_w, 640.0);
        assert_eq!(frame.image_h, 480.0);
        assert!(frame.bbox.is_none());
        assert!(frame.keypoints.is_empty());
    }

    #[test]
    fn test_persons_form_picks_highest_score() {
        let record = json!({
            "persons": [
                {"score": 0.4, "bbox": [0.0, 0.0, 1.0, 1.0], "keypoints": [{"x": 1.0, "y": 1.0, "conf": 0.9}]},
                {"score": 0.8, "bbox": [0.0, 0.0, 2.0, 2.0], "keypoints": [{"x": 2.0, "y": 2.0, "conf": 0.9}]}
            ],
            "image_size": {"width": 320.0, "height": 240.0}
        });
        let frame = extract_pose(&record);
        assert_eq!(frame.bbox, Some([0.0, 0.0, 2.0, 2.0]));
        assert_eq!(frame.image_w, 320.0);
        assert_eq!(frame.keypoints[0].x, 2.0);
    }

    #[test]
    fn test_extract_objects_normalizes_and_filters() {
        let record = json!({
            "detections": [
                {"name": "bed", "xyxy": [0.0, 0.0, 10.0, 10.0]},
                {"label": "  ", "bbox": [0.0, 0.0, 1.0, 1.0]},
                {"class_name": "chair"},
                "not a dict"
            ]
        });
        let objects = extract_objects(&record);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].class_name, "bed");
    }

    #[test]
    fn test_full_skeleton_gate() {
        let frame = extract_pose(&full_frame_record(0.9));
        assert!(has_full_skeleton(&frame, 17, true, 0.4));
        let weak = extract_pose(&full_frame_record(0.2));
        assert!(!has_full_skeleton(&weak, 17, true, 0.4));
        let no_box = extract_pose(&json!({"keypoints": [[[1.0, 1.0, 1.0]]]}));
        assert!(!has_full_skeleton(&no_box, 1, true, 0.4));
        assert!(has_full_skeleton(&no_box, 1, false, 0.4));
    }
}
