//! Process assembly: builds the node from the configuration, serves the RPC
//! surfaces and the metrics endpoint, and drives shutdown.

use crate::config;
use crate::kv_service::pb::kv_service_server::KvServiceServer;
use crate::kv_service::KvServiceSVC;
use crate::metrics;
use crate::raft::node::{Options, RaftNode};
use crate::raft::pb::raft_service_server::RaftServiceServer;
use crate::raft_service::RaftServiceSVC;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::sync::Mutex;

static INSTANCE: OnceCell<Mutex<Server>> = OnceCell::new();
pub fn instance() -> &'static Mutex<Server> {
    INSTANCE.get_or_init(|| Mutex::new(Server::builder()))
}

pub struct Server {
    node: Arc<RaftNode>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    fn builder() -> Self {
        let config = config::instance().lock().unwrap().clone();
        let options = Options {
            id: config.id,
            members: config
                .members
                .iter()
                .map(|member| format!("http://{}:{}", member.host, member.port))
                .collect(),
            dir: config.log.clone().into(),
            heartbeat_timeout: Duration::from_secs_f64(config.heartbeat_timeout),
            heartbeat_interval: Duration::from_secs_f64(config.heartbeat_interval),
            election_timeout: Duration::from_secs_f64(config.election_timeout),
            rotate_interval: Duration::from_secs_f64(config.rotate_interval),
            flush_interval: Duration::from_secs_f64(config.flush_interval),
            connect_timeout: Duration::from_secs_f64(config.max_delay),
            applied_backlog: config.applied_backlog,
            rpc_max_batch: config.rpc_max_batch,
            max_message: config.max_message,
            buffer_size: config.max_batch,
        };
        let (shutdown, _) = watch::channel(false);
        let node = crate::raft::fatal(RaftNode::new(options), "startup recovery failed");
        Server { node, shutdown }
    }

    pub async fn start(&mut self) {
        self.start_grpc_server().await;
        self.start_metrics_server().await;
        self.node.start(self.shutdown.subscribe());
    }

    pub fn stop(&mut self) {
        log::info!("server stop");
        let _ = self.shutdown.send(true);
    }

    async fn start_grpc_server(&mut self) {
        let config = config::instance().lock().unwrap().clone();
        let addr = format!("0.0.0.0:{}", config.port).parse().unwrap();
        let raft_service = RaftServiceSVC::new(self.node.clone());
        let kv_service = KvServiceSVC::new(self.node.clone());
        let grpc_server = tonic::transport::Server::builder()
            .concurrency_limit_per_connection(config.pool_size)
            .add_service(
                RaftServiceServer::new(raft_service)
                    .max_decoding_message_size(config.max_message)
                    .max_encoding_message_size(config.max_message),
            )
            .add_service(
                KvServiceServer::new(kv_service)
                    .max_decoding_message_size(config.max_message)
                    .max_encoding_message_size(config.max_message),
            )
            .serve(addr);
        tokio::spawn(async move {
            tokio::pin!(grpc_server);
            if let Err(e) = grpc_server.await {
                log::error!("grpc server failed: {}", e);
                std::process::exit(1);
            }
        });
        log::info!("grpc server started on {}", addr);
    }

    async fn start_metrics_server(&mut self) {
        let port = match config::instance().lock().unwrap().metrics_port {
            Some(port) => port,
            None => return,
        };
        let addr = format!("0.0.0.0:{}", port).parse().unwrap();
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        encoder.encode(&metric_families, &mut buffer).unwrap();
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::bind(&addr).serve(make_svc);
        tokio::spawn(async move {
            tokio::pin!(server);
            if let Err(e) = server.await {
                log::error!("metrics server failed: {}", e);
            }
        });
        log::info!("metrics server started on {}", addr);
    }
}
