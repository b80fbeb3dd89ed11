use anyhow::Context;
use poolgate::allocation::AllocationTracker;
use poolgate::config::Config;
use poolgate::gate::{self, GateComponents, GateOrchestrator};
use poolgate::gateway::{self, GatewayState};
use poolgate::metrics::{MemoryMetricsStore, MetricsRepository};
use poolgate::queue::{AdmissionQueue, DeadLetterQueue};
use poolgate::quota_pool::PoolRegistry;
use poolgate::runtime_config::{RuntimeSettings, SettingsHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;

    init_tracing(&cfg);

    let settings = SettingsHandle::new(RuntimeSettings::from_config(&cfg));
    if let Err(msg) = settings.get().validate() {
        anyhow::bail!("配置无效: {msg}");
    }

    let pools = Arc::new(PoolRegistry::new(cfg.pools.clone()));
    if pools.is_empty() {
        tracing::warn!("未配置任何池，所有请求都会返回 unknown pool");
    } else {
        tracing::info!("已加载 {} 个池: {}", pools.len(), pools.ids().join(", "));
    }

    let store = Arc::new(MemoryMetricsStore::new(cfg.metrics_retention()));
    let repo = Arc::new(MetricsRepository::new(store, cfg.repository_settings()));

    tokio::fs::create_dir_all(&cfg.data_dir)
        .await
        .with_context(|| format!("创建数据目录失败: {}", cfg.data_dir))?;

    let orchestrator = Arc::new(GateOrchestrator::new(GateComponents {
        pools,
        repo,
        tracker: Arc::new(AllocationTracker::default()),
        strategy: cfg.strategy.build(),
        queue: Arc::new(AdmissionQueue::new(cfg.queue_capacity)),
        dead_letters: Arc::new(DeadLetterQueue::with_journal(&cfg.data_dir)),
        settings,
        recorder_capacity: cfg.recorder_capacity,
    }));
    tracing::info!("准入策略: {:?}", orchestrator);

    // 后台任务：到期重试 + 超时预留清扫。
    gate::spawn_scheduler(orchestrator.clone());
    gate::spawn_sweep_task(orchestrator.clone(), cfg.sweep_interval());

    let app = gateway::router(Arc::new(GatewayState { orchestrator }));

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

fn init_tracing(cfg: &Config) {
    // 依赖库日志默认 warn，本项目日志至少 info；DEBUG=off 时全部关闭。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("off")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,poolgate=info")
        } else if env.contains("poolgate") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},poolgate=info"))
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);
    let _ = if cfg.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
