use crate::common::{Config, FaceLinkError, Result};
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::path::Path;
use std::sync::Arc;

const NMS_IOU_THRESHOLD: f32 = 0.45;
const MAX_FACES: usize = 5;
/// Boxes plus one score, then five `(x, y, visibility)` keypoints.
const LANDMARK_PREDICTION_LEN: usize = 5 + 5 * 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Five-point face landmarks in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceLandmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose: Point,
    pub mouth_left: Point,
    pub mouth_right: Point,
}

impl FaceLandmarks {
    fn scale(&mut self, sx: f32, sy: f32) {
        for p in [
            &mut self.left_eye,
            &mut self.right_eye,
            &mut self.nose,
            &mut self.mouth_left,
            &mut self.mouth_right,
        ] {
            p.x *= sx;
            p.y *= sy;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub landmarks: Option<FaceLandmarks>,
}

impl FaceBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// Anything that finds faces in a frame.
pub trait DetectFaces: Send {
    /// Faces sorted by descending confidence.
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>>;
}

/// YOLOv8-face ONNX detector.
pub struct FaceDetector {
    session: Session,
    _environment: Arc<Environment>,
    input_width: u32,
    input_height: u32,
    min_confidence: f32,
}

impl FaceDetector {
    pub fn new(config: &Config) -> Result<Self> {
        Self::new_with_model_path(config, Path::new("."))
    }

    /// Resolves a relative detector path against `models_base`.
    pub fn new_with_model_path(config: &Config, models_base: &Path) -> Result<Self> {
        let mut model_path = config.models.detector_path.clone();
        if model_path.is_relative() && !model_path.exists() {
            model_path = models_base.join(&model_path);
        }

        let environment = Arc::new(
            Environment::builder()
                .with_name("face_detector")
                .build()
                .map_err(|e| FaceLinkError::Model(format!("Failed to create environment: {}", e)))?,
        );

        if !model_path.exists() {
            return Err(FaceLinkError::Model(format!(
                "Detector model not found at: {:?}",
                model_path
            )));
        }

        let opt_level = match config.performance.optimization_level {
            0 => GraphOptimizationLevel::Disable,
            1 => GraphOptimizationLevel::Level1,
            2 => GraphOptimizationLevel::Level2,
            _ => GraphOptimizationLevel::Level3,
        };
        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(opt_level)?
            .with_model_from_file(&model_path)?;

        tracing::info!("Loaded face detector from {}", model_path.display());

        Ok(Self {
            session,
            _environment: environment,
            input_width: config.detector.input_width,
            input_height: config.detector.input_height,
            min_confidence: config.detector.detection_confidence,
        })
    }

    fn image_to_array(&self, img: &DynamicImage) -> Array4<f32> {
        let rgb = img.to_rgb8();
        let width = rgb.width() as usize;
        let height = rgb.height() as usize;
        let mut array = Array4::<f32>::zeros((1, 3, height, width));

        let norm_factor = 1.0 / 255.0;
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = pixel[0] as f32 * norm_factor;
            array[[0, 1, y, x]] = pixel[1] as f32 * norm_factor;
            array[[0, 2, y, x]] = pixel[2] as f32 * norm_factor;
        }

        array
    }
}

impl DetectFaces for FaceDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let orig_width = image.width() as f32;
        let orig_height = image.height() as f32;

        let img_array = if image.width() == self.input_width && image.height() == self.input_height {
            self.image_to_array(image)
        } else {
            let resized = image.resize_exact(self.input_width, self.input_height, FilterType::Nearest);
            self.image_to_array(&resized)
        };

        let cow_array = CowArray::from(img_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let Some(first) = outputs.first() else {
            return Ok(Vec::new());
        };
        let extracted = first.try_extract::<f32>()?;
        let view = extracted.view();
        let shape = view.shape().to_vec();
        let data: Vec<f32> = view.iter().copied().collect();

        let mut faces = decode_predictions(&data, &shape, self.input_width as f32, self.input_height as f32);
        faces = apply_nms(faces, NMS_IOU_THRESHOLD);
        faces.retain(|face| face.confidence >= self.min_confidence);
        faces.truncate(MAX_FACES);

        let scale_x = orig_width / self.input_width as f32;
        let scale_y = orig_height / self.input_height as f32;
        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
            if let Some(landmarks) = face.landmarks.as_mut() {
                landmarks.scale(scale_x, scale_y);
            }
        }

        Ok(faces)
    }
}

/// Turns raw YOLOv8 output into candidate boxes in input-pixel coordinates.
///
/// Accepts `[1, N, L]`, the transposed `[1, L, N]` and `[N, L]`. Keypoints
/// are read when `L` carries them.
pub fn decode_predictions(data: &[f32], shape: &[usize], input_width: f32, input_height: f32) -> Vec<FaceBox> {
    let mut faces = Vec::new();

    let (num_predictions, prediction_length, is_transposed) = match shape.len() {
        3 if shape[2] > shape[1] && shape[1] <= LANDMARK_PREDICTION_LEN => (shape[2], shape[1], true),
        3 => (shape[1], shape[2], false),
        2 => (shape[0], shape[1], false),
        _ => {
            tracing::warn!("Unexpected output shape: {:?}", shape);
            return faces;
        }
    };
    if prediction_length < 5 || data.len() < num_predictions * prediction_length {
        tracing::warn!("Detector output too short for shape {:?}", shape);
        return faces;
    }

    let at = |i: usize, field: usize| -> f32 {
        if is_transposed {
            data[field * num_predictions + i]
        } else {
            data[i * prediction_length + field]
        }
    };

    for i in 0..num_predictions {
        let (cx, cy, w, h, confidence) = (at(i, 0), at(i, 1), at(i, 2), at(i, 3), at(i, 4));
        if confidence <= 0.001 {
            continue;
        }

        // Normalized coordinates need scaling to input pixels.
        let scale = if cx > 1.0 || cy > 1.0 || w > 1.0 || h > 1.0 { 1.0 } else { input_width };
        let (cx, cy, w, h) = (cx * scale, cy * scale, w * scale, h * scale);

        let x1 = (cx - w / 2.0).max(0.0);
        let y1 = (cy - h / 2.0).max(0.0);
        let x2 = (cx + w / 2.0).min(input_width);
        let y2 = (cy + h / 2.0).min(input_height);
        if !(x2 > x1 && y2 > y1 && (x2 - x1) > 10.0 && (y2 - y1) > 10.0) {
            continue;
        }

        let landmarks = if prediction_length >= LANDMARK_PREDICTION_LEN {
            let point = |k: usize| Point {
                x: at(i, 5 + k * 3) * scale,
                y: at(i, 5 + k * 3 + 1) * scale,
            };
            Some(FaceLandmarks {
                left_eye: point(0),
                right_eye: point(1),
                nose: point(2),
                mouth_left: point(3),
                mouth_right: point(4),
            })
        } else {
            None
        };

        faces.push(FaceBox { x1, y1, x2, y2, confidence, landmarks });
    }

    faces
}

/// Greedy non-maximum suppression. The result is sorted by confidence.
pub fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| calculate_iou(kept, &candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn calculate_iou(box1: &FaceBox, box2: &FaceBox) -> f32 {
    let x1 = box1.x1.max(box2.x1);
    let y1 = box1.y1.max(box2.y1);
    let x2 = box1.x2.min(box2.x2);
    let y2 = box1.y2.min(box2.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = box1.width() * box1.height() + box2.width() * box2.height() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> FaceBox {
        FaceBox { x1, y1, x2, y2, confidence, landmarks: None }
    }

    #[test]
    fn nms_keeps_best_of_overlapping_boxes() {
        let boxes = vec![
            face(0.0, 0.0, 100.0, 100.0, 0.6),
            face(5.0, 5.0, 105.0, 105.0, 0.9),
            face(300.0, 300.0, 400.0, 400.0, 0.7),
        ];
        let kept = apply_nms(boxes, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.7);
    }

    #[test]
    fn decodes_transposed_output_with_keypoints() {
        // Predictions with 20 fields each, laid out field-major.
        let n = 32;
        let mut data = vec![0.0f32; 20 * n];
        let mut set = |field: usize, i: usize, v: f32| data[field * n + i] = v;
        set(0, 0, 320.0);
        set(1, 0, 240.0);
        set(2, 0, 200.0);
        set(3, 0, 260.0);
        set(4, 0, 0.92);
        for (k, (x, y)) in [(280.0, 200.0), (360.0, 200.0), (320.0, 240.0), (290.0, 290.0), (350.0, 290.0)]
            .into_iter()
            .enumerate()
        {
            set(5 + k * 3, 0, x);
            set(6 + k * 3, 0, y);
        }
        // The remaining predictions have no confidence.

        let faces = decode_predictions(&data, &[1, 20, n], 640.0, 640.0);
        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        assert_eq!((f.x1, f.y1, f.x2, f.y2), (220.0, 110.0, 420.0, 370.0));
        let lm = f.landmarks.unwrap();
        assert_eq!(lm.nose, Point { x: 320.0, y: 240.0 });
        assert_eq!(lm.mouth_right, Point { x: 350.0, y: 290.0 });
    }

    #[test]
    fn box_only_output_has_no_landmarks() {
        let data = vec![0.5, 0.5, 0.25, 0.25, 0.8];
        let faces = decode_predictions(&data, &[1, 5], 640.0, 640.0);
        assert_eq!(faces.len(), 1);
        assert!(faces[0].landmarks.is_none());
        assert_eq!(faces[0].width(), 160.0);
    }

    #[test]
    fn unexpected_shapes_yield_nothing() {
        assert!(decode_predictions(&[1.0; 4], &[4], 640.0, 640.0).is_empty());
        assert!(decode_predictions(&[1.0; 4], &[1, 1, 4], 640.0, 640.0).is_empty());
    }
}
