use fire_proto::VideoFrame;
use tonic::{async_trait, Status};

/// One labeled model output for a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

#[async_trait]
pub trait ModelService: Send + Sync + Clone + 'static {
    async fn predict(&self, frame: VideoFrame) -> Result<Vec<Detection>, Status>;
}
