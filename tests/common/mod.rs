#![allow(dead_code, clippy::unwrap_used)]

use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Algorithm, Argon2, Params, PasswordHasher, Version,
};
use registrar::{
    broker::{
        rpc::{RpcClient, RpcConfig},
        topology::{self, Topology, TopologyConfig},
        Broker, ConsumeError, MemoryBroker,
    },
    store::MemoryUserStore,
    verifier::{VerificationConsumer, VerifierConfig},
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};

pub const EMAIL: &str = "ada@example.com";
pub const PASSWORD: &str = "correct horse battery staple";

/// Argon2id with minimal cost so tests stay fast in debug builds. Verification
/// reads the parameters back from the PHC string.
pub fn cheap_hash(password: &str) -> String {
    let params = Params::new(8, 1, 1, None).unwrap();
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(password.as_bytes(), &SaltString::generate(&mut OsRng))
        .unwrap()
        .to_string()
}

pub async fn declared_broker(config: &TopologyConfig) -> Arc<MemoryBroker> {
    let broker = Arc::new(MemoryBroker::new());
    topology::declare(broker.as_ref(), &Topology::registration(config))
        .await
        .unwrap();
    broker
}

pub fn rpc_config(config: &TopologyConfig) -> RpcConfig {
    RpcConfig {
        exchange: config.auth_exchange.clone(),
        routing_key: config.verification_routing_key.clone(),
        reply_queue: config.response_queue.clone(),
    }
}

pub fn verifier_config(config: &TopologyConfig) -> VerifierConfig {
    VerifierConfig {
        queue: config.verification_queue.clone(),
        reply_exchange: config.auth_exchange.clone(),
        reply_routing_key: config.response_routing_key.clone(),
        prefetch: 1,
    }
}

/// Declared broker, a seeded user store, `workers` verification consumers and
/// an RPC client, all wired the way the server wires them.
pub struct Harness {
    pub config: TopologyConfig,
    pub broker: Arc<MemoryBroker>,
    pub store: Arc<MemoryUserStore>,
    pub rpc: Arc<RpcClient>,
    shutdown: watch::Sender<bool>,
    consumers: Vec<JoinHandle<Result<(), ConsumeError>>>,
}

impl Harness {
    pub async fn start(workers: usize) -> Self {
        let config = TopologyConfig::default();
        let broker = declared_broker(&config).await;
        let store = Arc::new(
            MemoryUserStore::new()
                .with_user(EMAIL, &cheap_hash(PASSWORD))
                .await,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let dyn_broker: Arc<dyn Broker> = broker.clone();
        let consumers = (0..workers)
            .map(|_| {
                let consumer = VerificationConsumer::new(
                    dyn_broker.clone(),
                    store.clone(),
                    verifier_config(&config),
                );
                tokio::spawn(consumer.run(shutdown_rx.clone()))
            })
            .collect();

        let rpc = Arc::new(
            RpcClient::start(dyn_broker, rpc_config(&config))
                .await
                .unwrap(),
        );

        Self {
            config,
            broker,
            store,
            rpc,
            shutdown,
            consumers,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for consumer in self.consumers {
            tokio::time::timeout(Duration::from_secs(5), consumer)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }
}
