use crate::model_service::{Detection, ModelService};
use async_stream::stream;
use fire_proto::fire_detection_service_server::FireDetectionService;
use fire_proto::{VideoFrame, VideoResponse};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tonic::{async_trait, Request, Response, Status, Streaming};

const FIRE_LABEL: &str = "fire";

#[derive(Debug, Clone)]
pub struct DetectionService<M: ModelService> {
    model_service: Arc<M>,
}

impl<M: ModelService> DetectionService<M> {
    pub fn new(model_service: M) -> Self {
        Self {
            model_service: Arc::new(model_service),
        }
    }
}

fn frame_response(detections: &[Detection], timestamp: i64) -> VideoResponse {
    let detected = detections.iter().any(|d| d.label == FIRE_LABEL);
    let message = if detected { "Fire detected!" } else { "No fire" };

    VideoResponse {
        detected,
        message: message.to_string(),
        timestamp,
    }
}

fn frame_error(status: Status, timestamp: i64) -> Status {
    Status::new(
        status.code(),
        format!(
            "frame at timestamp {}: {}",
            timestamp,
            status.message()
        ),
    )
}

/// One response per inbound frame, in arrival order. The first failed frame
/// terminates the stream with a status naming its timestamp.
fn detection_stream<M: ModelService>(
    model_service: Arc<M>,
    mut inbound: impl Stream<Item = Result<VideoFrame, Status>> + Send + Unpin + 'static,
) -> impl Stream<Item = Result<VideoResponse, Status>> + Send {
    stream! {
        while let Some(frame) = inbound.next().await {
            match frame {
                Ok(frame) => {
                    let timestamp = frame.timestamp;
                    match model_service.predict(frame).await {
                        Ok(detections) => {
                            let response = frame_response(&detections, timestamp);
                            if response.detected {
                                tracing::info!("fire detected at timestamp {}", timestamp);
                            }
                            yield Ok(response);
                        }
                        Err(status) => {
                            tracing::error!(
                                "closing stream, frame at timestamp {} failed: {}",
                                timestamp,
                                status.message()
                            );
                            yield Err(frame_error(status, timestamp));
                            break;
                        }
                    }
                }
                Err(status) => {
                    yield Err(status);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl<M: ModelService> FireDetectionService for DetectionService<M> {
    type StreamVideoStream = Pin<Box<dyn Stream<Item = Result<VideoResponse, Status>> + Send>>;

    async fn stream_video(
        &self,
        request: Request<Streaming<VideoFrame>>,
    ) -> Result<Response<Self::StreamVideoStream>, Status> {
        let inbound = request.into_inner();
        let model_service = self.model_service.clone();

        tracing::debug!("detection stream opened");

        Ok(Response::new(Box::pin(detection_stream(
            model_service,
            inbound,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn detection(label: &str) -> Detection {
        Detection {
            label: label.to_string(),
            confidence: 0.9,
            x1: 10.0,
            y1: 20.0,
            x2: 100.0,
            y2: 150.0,
        }
    }

    fn frame(timestamp: i64) -> Result<VideoFrame, Status> {
        Ok(VideoFrame {
            data: vec![0; 64],
            timestamp,
        })
    }

    // Labels are scripted per frame timestamp so a stream can exercise
    // several outcomes in one pass.
    #[derive(Clone)]
    struct ScriptedModelService;

    #[async_trait]
    impl ModelService for ScriptedModelService {
        async fn predict(&self, frame: VideoFrame) -> Result<Vec<Detection>, Status> {
            let labels: &[&str] = match frame.timestamp {
                1 => &["person"],
                2 => &["fire", "person"],
                _ => &[],
            };

            Ok(labels.iter().map(|label| detection(label)).collect())
        }
    }

    #[derive(Clone)]
    struct FailingModelService;

    #[async_trait]
    impl ModelService for FailingModelService {
        async fn predict(&self, frame: VideoFrame) -> Result<Vec<Detection>, Status> {
            if frame.timestamp < 2 {
                Ok(vec![detection("person")])
            } else {
                Err(Status::invalid_argument("image decode failed"))
            }
        }
    }

    #[tokio::test]
    async fn test_responses_follow_frame_order() {
        let inbound = stream::iter(vec![frame(1), frame(2), frame(3)]);
        let outputs: Vec<_> = detection_stream(Arc::new(ScriptedModelService), inbound)
            .collect()
            .await;

        let responses: Vec<VideoResponse> =
            outputs.into_iter().map(|result| result.unwrap()).collect();

        assert_eq!(responses.len(), 3);

        assert!(!responses[0].detected);
        assert_eq!(responses[0].message, "No fire");
        assert_eq!(responses[0].timestamp, 1);

        assert!(responses[1].detected);
        assert_eq!(responses[1].message, "Fire detected!");
        assert_eq!(responses[1].timestamp, 2);

        assert!(!responses[2].detected);
        assert_eq!(responses[2].message, "No fire");
        assert_eq!(responses[2].timestamp, 3);
    }

    #[tokio::test]
    async fn test_empty_stream_emits_no_responses() {
        let inbound = stream::iter(Vec::<Result<VideoFrame, Status>>::new());
        let outputs: Vec<_> = detection_stream(Arc::new(ScriptedModelService), inbound)
            .collect()
            .await;

        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn test_failed_frame_terminates_stream() {
        let inbound = stream::iter(vec![frame(1), frame(2), frame(3)]);
        let mut outputs: Vec<_> = detection_stream(Arc::new(FailingModelService), inbound)
            .collect()
            .await;

        // Frame 3 is never processed once frame 2 fails.
        assert_eq!(outputs.len(), 2);

        let first = outputs.remove(0).unwrap();
        assert_eq!(first.timestamp, 1);

        let status = outputs.remove(0).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("timestamp 2"));
        assert!(status.message().contains("image decode failed"));
    }

    #[tokio::test]
    async fn test_inbound_error_terminates_stream() {
        let inbound = stream::iter(vec![
            frame(1),
            Err(Status::cancelled("client went away")),
            frame(3),
        ]);
        let outputs: Vec<_> = detection_stream(Arc::new(ScriptedModelService), inbound)
            .collect()
            .await;

        assert_eq!(outputs.len(), 2);
        assert!(outputs[0].is_ok());
        assert_eq!(
            outputs[1].as_ref().unwrap_err().code(),
            tonic::Code::Cancelled
        );
    }

    #[test]
    fn test_frame_response_flags_fire_label() {
        let detections = vec![detection("person"), detection("fire")];
        let response = frame_response(&detections, 42);

        assert!(response.detected);
        assert_eq!(response.message, "Fire detected!");
        assert_eq!(response.timestamp, 42);
    }

    #[test]
    fn test_frame_response_without_fire_label() {
        let response = frame_response(&[detection("person")], 7);

        assert!(!response.detected);
        assert_eq!(response.message, "No fire");
        assert_eq!(response.timestamp, 7);
    }
}
