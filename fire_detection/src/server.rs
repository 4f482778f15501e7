use crate::{
    config::Config, detection_service::DetectionService, model_service::ModelService,
    ort_service::OrtModelService,
};
use fire_proto::fire_detection_service_server::FireDetectionServiceServer;
use tokio::signal;
use tonic::transport::server::Router;
use tonic::transport::Server;

pub struct GrpcServer {
    router: Router,
    addr: String,
}

impl GrpcServer {
    pub async fn new<M: ModelService>(model_service: M, addr: &str) -> Self {
        let detection_service = DetectionService::new(model_service);

        let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<FireDetectionServiceServer<DetectionService<M>>>()
            .await;

        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(fire_proto::FILE_DESCRIPTOR_SET)
            .build_v1alpha()
            .unwrap();

        let router = Server::builder()
            .add_service(FireDetectionServiceServer::new(detection_service))
            .add_service(health_service)
            .add_service(reflection_service);

        Self {
            router,
            addr: addr.to_string(),
        }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let addr = self.addr.parse().expect("failed to parse address");

        tracing::info!("Detection service listening on {}", self.addr);

        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        self.router.serve_with_shutdown(addr, shutdown).await?;
        Ok(())
    }
}

pub async fn start_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    // The model must be fully loaded before the listener accepts a stream.
    let model_service = OrtModelService::new(&config.model, &config.labels)?;

    let addr = config.server.get_address();
    let grpc_server = GrpcServer::new(model_service, &addr).await;

    grpc_server.run().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
