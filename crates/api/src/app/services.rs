//! Service wiring: adapters in, request-facing services out.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use provisioner_crypto::EncryptionService;
use provisioner_infra::checkout::{CheckoutService, Price};
use provisioner_infra::config::Config;
use provisioner_infra::external::{
    DeploymentPlatform, LogNotifier, Notifier, PaymentGateway, RailwayClient, RazorpayGateway,
};
use provisioner_infra::installs::InstallLookup;
use provisioner_infra::jobs::{JobQueue, JobQueueConfig};
use provisioner_infra::ledger::{Ledger, PostgresLedger};
use provisioner_infra::provisioning::{Provisioner, ProvisionerConfig};
use provisioner_infra::rate_limit::{CounterStore, InMemoryCounterStore, RateLimitConfig, RateLimiter};
use provisioner_infra::webhooks::WebhookIngestor;

use crate::middleware::{KeyGenerator, key_generator};

/// Everything that talks to the outside world.
pub struct Adapters {
    pub ledger: Arc<dyn Ledger>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub platform: Arc<dyn DeploymentPlatform>,
    pub notifier: Arc<dyn Notifier>,
    pub counters: Arc<dyn CounterStore>,
    pub crypto: Arc<EncryptionService>,
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub jobs: JobQueueConfig,
    pub provisioner: ProvisionerConfig,
    pub price: Price,
    pub rate_limit: RateLimitConfig,
    /// `None` disables the operator endpoints.
    pub admin_token: Option<String>,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            jobs: config.jobs,
            provisioner: config.provisioner.clone(),
            price: config.price.clone(),
            rate_limit: config.rate_limit.clone(),
            admin_token: config.admin_api_token.clone(),
        }
    }
}

pub struct AppServices {
    pub ledger: Arc<dyn Ledger>,
    pub queue: Arc<JobQueue>,
    pub provisioner: Arc<Provisioner>,
    pub ingestor: WebhookIngestor,
    pub checkout: CheckoutService,
    pub installs: InstallLookup,
    pub rate_limiter: RateLimiter,
    pub rate_limit_key: KeyGenerator,
    pub counters: Arc<dyn CounterStore>,
    pub admin_token: Option<String>,
}

impl AppServices {
    pub fn assemble(adapters: Adapters, settings: Settings) -> Self {
        let Adapters {
            ledger,
            gateway,
            platform,
            notifier,
            counters,
            crypto,
        } = adapters;

        let queue = Arc::new(JobQueue::new(ledger.clone(), settings.jobs));
        let provisioner = Arc::new(Provisioner::new(
            ledger.clone(),
            queue.clone(),
            platform,
            crypto,
            notifier,
            settings.provisioner,
        ));
        let ingestor = WebhookIngestor::new(ledger.clone(), queue.clone()).with_gateway(gateway.clone());
        let checkout = CheckoutService::new(ledger.clone(), gateway, settings.price);

        Self {
            installs: InstallLookup::new(ledger.clone()),
            rate_limit_key: key_generator(settings.rate_limit.key_source),
            rate_limiter: RateLimiter::new(counters.clone(), settings.rate_limit),
            ledger,
            queue,
            provisioner,
            ingestor,
            checkout,
            counters,
            admin_token: settings.admin_token,
        }
    }

    /// Production wiring: Postgres ledger (migrated), Razorpay, Railway.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = PgPool::connect(&config.database_url)
            .await
            .context("failed to connect to Postgres")?;
        let ledger = PostgresLedger::new(pool);
        ledger.migrate().await.context("failed to apply ledger schema")?;

        let gateway = RazorpayGateway::with_timeouts(
            config.razorpay.clone(),
            config.http_connect_timeout,
            config.http_timeout,
        )
        .context("failed to build payment gateway client")?;
        let platform = RailwayClient::with_timeouts(
            config.railway.clone(),
            config.http_connect_timeout,
            config.http_timeout,
        )
        .context("failed to build deployment platform client")?;
        let crypto = EncryptionService::from_hex(&config.master_encryption_key)
            .context("invalid MASTER_ENCRYPTION_KEY")?;

        let adapters = Adapters {
            ledger: Arc::new(ledger),
            gateway: Arc::new(gateway),
            platform: Arc::new(platform),
            notifier: Arc::new(LogNotifier),
            counters: Arc::new(InMemoryCounterStore::new()),
            crypto: Arc::new(crypto),
        };
        Ok(Self::assemble(adapters, Settings::from(config)))
    }
}
