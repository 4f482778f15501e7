use crate::{
    config::{LabelsConfig, ModelConfig},
    labels::load_class_labels,
    model_service::{Detection, ModelService},
};
use fire_proto::VideoFrame;
use image::{imageops::FilterType, GenericImageView};
use ndarray::{s, Array, Axis, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use thiserror::Error;
use tonic::{async_trait, Status};

const INPUT_SIZE: u32 = 640;
const IOU_THRESHOLD: f32 = 0.7;

#[derive(Error, Debug)]
pub enum ModelInitError {
    #[error("onnx runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("failed to load class labels: {0}")]
    Labels(#[from] std::io::Error),
}

fn intersection(box1: &Detection, box2: &Detection) -> f32 {
    (box1.x2.min(box2.x2) - box1.x1.max(box2.x1)) * (box1.y2.min(box2.y2) - box1.y1.max(box2.y1))
}

fn union(box1: &Detection, box2: &Detection) -> f32 {
    ((box1.x2 - box1.x1) * (box1.y2 - box1.y1)) + ((box2.x2 - box2.x1) * (box2.y2 - box2.y1))
        - intersection(box1, box2)
}

fn decode_frame(frame: &VideoFrame) -> Result<(Array<f32, Ix4>, u32, u32), String> {
    let image_reader = image::ImageReader::new(std::io::Cursor::new(&frame.data))
        .with_guessed_format()
        .map_err(|e| format!("Error decoding image: {}", e))?;

    let original_img = image_reader
        .decode()
        .map_err(|e| format!("Error decoding image: {}", e))?;

    let (img_width, img_height) = original_img.dimensions();
    let img = original_img.resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom);

    let mut input = Array::zeros((1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize));
    for pixel in img.pixels() {
        let x = pixel.0 as _;
        let y = pixel.1 as _;
        let [r, g, b, _] = pixel.2 .0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    Ok((input, img_height, img_width))
}

/// Round-robin pool of ONNX sessions sharing one loaded model. Each session
/// sits behind its own mutex so concurrent streams never race on a session.
#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    class_labels: Arc<Vec<String>>,
    min_probability: f32,
}

impl OrtModelService {
    pub fn new(
        model_config: &ModelConfig,
        labels_config: &LabelsConfig,
    ) -> Result<Self, ModelInitError> {
        ort::init().commit();

        let num_instances = model_config.num_instances;
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        let class_labels = load_class_labels(&labels_config.get_path())?;

        tracing::info!(
            "Created {} ONNX sessions with {} class labels",
            num_instances,
            class_labels.len()
        );

        Ok(Self {
            counter: Arc::new(AtomicUsize::new(0)),
            sessions: Arc::new(sessions),
            class_labels: Arc::new(class_labels),
            min_probability: model_config.min_probability,
        })
    }

    fn class_label(&self, class_id: usize) -> String {
        self.class_labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ndarray::ArrayD<f32>, Box<Status>> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let session_arc = &self.sessions[index];
        let mut session = session_arc
            .lock()
            .map_err(|e| Status::internal(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.to_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| Status::internal(format!("failed to build tensor: {}", e)))?;

        let input_tensor = ort::inputs![tensor_ref];

        let outputs = session
            .run(input_tensor)
            .map_err(|e| Status::internal(format!("inference failed: {}", e)))?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| Status::internal(format!("failed to extract tensor: {}", e)))?;

        let ix = shape.to_ixdyn();
        let array = ndarray::ArrayD::from_shape_vec(ix, data.to_vec())
            .map_err(|e| Status::internal(format!("invalid tensor shape: {}", e)))?;

        Ok(array)
    }
}

#[async_trait]
impl ModelService for OrtModelService {
    async fn predict(&self, frame: VideoFrame) -> Result<Vec<Detection>, Status> {
        let (input, img_height, img_width) = match decode_frame(&frame) {
            Ok(result) => result,
            Err(err) => {
                return Err(Status::invalid_argument(format!(
                    "Image transformation error: {}",
                    err
                )))
            }
        };

        let outputs = match self.run_inference(&input) {
            Ok(outputs) => outputs,
            Err(err) => return Err(*err),
        };

        // output0 is (1, 4 + num_classes, num_anchors); one column per anchor
        let mut boxes = Vec::new();
        let output = outputs.slice(s![0, .., ..]);

        for row in output.axis_iter(Axis(1)) {
            let row: Vec<_> = row.iter().copied().collect();
            let (class_id, prob) = row
                .iter()
                .skip(4)
                .enumerate()
                .map(|(index, value)| (index, *value))
                .reduce(|accum, row| if row.1 > accum.1 { row } else { accum })
                .unwrap_or((0, 0.0));

            if prob < self.min_probability {
                continue;
            }

            let xc = row[0] / INPUT_SIZE as f32 * (img_width as f32);
            let yc = row[1] / INPUT_SIZE as f32 * (img_height as f32);
            let w = row[2] / INPUT_SIZE as f32 * (img_width as f32);
            let h = row[3] / INPUT_SIZE as f32 * (img_height as f32);

            boxes.push(Detection {
                label: self.class_label(class_id),
                confidence: prob,
                x1: xc - w / 2.,
                y1: yc - h / 2.,
                x2: xc + w / 2.,
                y2: yc + h / 2.,
            });
        }

        boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));
        let mut result = Vec::new();

        while !boxes.is_empty() {
            let best = boxes.remove(0);
            boxes.retain(|other| intersection(&best, other) / union(&best, other) < IOU_THRESHOLD);
            result.push(best);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;

    #[test]
    fn test_decode_frame() {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(100, 100, Rgb([255, 0, 0]));
        let mut image_data: Vec<u8> = Vec::new();
        let mut cursor = Cursor::new(&mut image_data);
        img.write_to(&mut cursor, image::ImageFormat::Png).unwrap();

        let frame = VideoFrame {
            data: cursor.get_ref().to_vec(),
            timestamp: 0,
        };

        let (input, img_height, img_width) = decode_frame(&frame).unwrap();

        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert_eq!(img_width, 100);
        assert_eq!(img_height, 100);
    }

    #[test]
    fn test_decode_frame_rejects_garbage() {
        let frame = VideoFrame {
            data: vec![0xde, 0xad, 0xbe, 0xef],
            timestamp: 0,
        };

        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn test_overlapping_boxes_intersection() {
        let box1 = Detection {
            label: "fire".to_string(),
            confidence: 0.9,
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 10.0,
        };
        let box2 = Detection {
            label: "fire".to_string(),
            confidence: 0.8,
            x1: 5.0,
            y1: 5.0,
            x2: 15.0,
            y2: 15.0,
        };

        assert_eq!(intersection(&box1, &box2), 25.0);
        assert_eq!(union(&box1, &box2), 175.0);
    }
}
