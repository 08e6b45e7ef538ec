//! 主应用程序入口
//!
//! 组装消息/回应管线的全部组件并启动 Web 服务：Kafka 通道、分发与回写
//! 工作器、Redis 锁/缓存/在线状态、权限判定，以及触发器回调的 HTTP 入口。

use application::{
    Cache, CacheOptions, DistributionWorker, LockConfig, LockManager, PermissionOracle,
    PresenceConfig, PresenceTracker, SystemClock, WritebackConfig, WritebackWorker,
};
use application::broker::{BrokerChannel, ConsumerRole};
use application::transport::LiveTransport;
use config_center::AppConfig;
use domain::{Message, Reaction};
use infrastructure::{
    KafkaBrokerChannel, MessagingConfig, PgChatFetcher, PgGrantsFetcher, PgMessageStore,
    PgReactionStore, RedisCacheStore, RedisLiveTransport, RedisLockBackend,
    RedisPresencePublisher, RedisPresenceStore,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

const ROOM_CHANNEL_PREFIX: &str = "room:";
const DANGLING_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let app_config = AppConfig::from_env_with_defaults();
    app_config
        .validate()
        .map_err(|e| anyhow::anyhow!("应用配置无效: {}", e))?;

    let messaging = MessagingConfig::from_env()?;
    messaging
        .validate()
        .map_err(|e| anyhow::anyhow!("消息架构配置无效: {}", e))?;

    tracing::info!(
        database = %app_config.database.url.split('@').next_back().unwrap_or("unknown"),
        brokers = %messaging.kafka.brokers.join(","),
        "加载配置完成"
    );

    // PostgreSQL 连接池与迁移
    let pg_pool = PgPoolOptions::new()
        .max_connections(app_config.database.max_connections)
        .connect(&app_config.database.url)
        .await?;
    sqlx::migrate!("../../migrations").run(&pg_pool).await?;

    // Redis 连接（所有适配器共享一个多路复用连接管理器）
    let redis_client = redis::Client::open(app_config.redis.url.as_str())?;
    let redis_conn = redis_client.get_connection_manager().await?;

    let clock = Arc::new(SystemClock);
    let locks = LockManager::new(
        Arc::new(RedisLockBackend::new(redis_conn.clone())),
        LockConfig::default(),
    );

    // 权限判定缓存
    let mut chat_options = CacheOptions::new("ChatInfo");
    chat_options.rate_limit_period = Duration::from_secs(messaging.cache.rate_limit_secs);
    chat_options.refetch_after = Duration::from_secs(messaging.cache.refetch_after_secs);
    chat_options.offline = messaging.cache.offline;
    let mut grant_options = CacheOptions::new("UserGrants");
    grant_options.rate_limit_period = chat_options.rate_limit_period;
    grant_options.refetch_after = chat_options.refetch_after;
    grant_options.offline = chat_options.offline;

    let cache_store = Arc::new(RedisCacheStore::new(redis_conn.clone()));
    let chats = Arc::new(Cache::new(
        cache_store.clone(),
        locks.clone(),
        Arc::new(PgChatFetcher::new(pg_pool.clone())),
        clock.clone(),
        chat_options,
    ));
    let grants = Arc::new(Cache::new(
        cache_store,
        locks.clone(),
        Arc::new(PgGrantsFetcher::new(pg_pool.clone())),
        clock.clone(),
        grant_options,
    ));
    let oracle = Arc::new(PermissionOracle::new(grants, chats.clone()));

    // Kafka 通道（每个消息域一个主题）
    let message_channel: Arc<dyn BrokerChannel> = Arc::new(KafkaBrokerChannel::new(
        &messaging.kafka,
        messaging.kafka.message_topic.clone(),
    )?);
    let reaction_channel: Arc<dyn BrokerChannel> = Arc::new(KafkaBrokerChannel::new(
        &messaging.kafka,
        messaging.kafka.reaction_topic.clone(),
    )?);

    // 实时传输
    let transport: Arc<dyn LiveTransport> =
        Arc::new(RedisLiveTransport::new(redis_conn.clone(), ROOM_CHANNEL_PREFIX));

    // 分发工作器
    let message_distribution = DistributionWorker::<Message>::new(transport.clone(), "messages");
    tokio::spawn(
        message_distribution.run(message_channel.subscribe(ConsumerRole::Distribution).await?),
    );
    let reaction_distribution = DistributionWorker::<Reaction>::new(transport.clone(), "reactions");
    tokio::spawn(
        reaction_distribution.run(reaction_channel.subscribe(ConsumerRole::Distribution).await?),
    );

    // 回写工作器（保留句柄用于停机前的最后一次刷新）
    let writeback_config = WritebackConfig {
        flush_threshold: messaging.writeback.flush_threshold,
        flush_interval: messaging.writeback.flush_interval(),
    };
    let message_writeback = WritebackWorker::new(
        Arc::new(PgMessageStore::new(pg_pool.clone())),
        clock.clone(),
        writeback_config.clone(),
        "messages",
    );
    tokio::spawn(
        message_writeback
            .clone()
            .run(message_channel.subscribe(ConsumerRole::Writeback).await?),
    );
    let reaction_writeback = WritebackWorker::new(
        Arc::new(PgReactionStore::new(pg_pool.clone())),
        clock.clone(),
        writeback_config,
        "reactions",
    );
    tokio::spawn(
        reaction_writeback
            .clone()
            .run(reaction_channel.subscribe(ConsumerRole::Writeback).await?),
    );

    // 在线状态跟踪与悬挂会话清理
    let presence = Arc::new(PresenceTracker::new(
        Arc::new(RedisPresenceStore::new(redis_conn.clone())),
        locks,
        Arc::new(RedisPresencePublisher::new(
            redis_conn,
            messaging.redis.presence_channel_prefix.clone(),
        )),
        clock,
        PresenceConfig::default(),
    ));
    tokio::spawn(dangling_sweep_loop(presence, transport));

    // 应用层服务与 HTTP 入口
    let message_service = Arc::new(application::MessageService::new(
        application::MessageServiceDependencies {
            oracle: oracle.clone(),
            channel: message_channel,
            chats,
            clock: Arc::new(SystemClock),
        },
    ));
    let reaction_service = Arc::new(application::ReactionService::new(
        application::ReactionServiceDependencies {
            oracle,
            channel: reaction_channel,
            clock: Arc::new(SystemClock),
        },
    ));

    let state = AppState::new(message_service, reaction_service, pg_pool);
    let app = router(state);
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(addr = %addr, "会议消息骨干已启动");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 停机前把缓冲中的动作刷进数据库
    tracing::info!("收到停机信号，执行最后一次回写刷新");
    message_writeback.flush().await;
    reaction_writeback.flush().await;

    Ok(())
}

/// 启动时做一次悬挂会话清理，之后周期性巡检
async fn dangling_sweep_loop(presence: Arc<PresenceTracker>, transport: Arc<dyn LiveTransport>) {
    let mut ticker = tokio::time::interval(DANGLING_SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        // 存活集合读取失败时跳过本轮，宁可漏清不可误清
        let live = match transport.live_sessions().await {
            Ok(live) => live,
            Err(err) => {
                tracing::warn!(error = %err, "读取存活会话失败，跳过本轮清理");
                continue;
            }
        };
        match presence.reconcile_dangling(&live).await {
            Ok(0) => {}
            Ok(cleaned) => tracing::info!(cleaned, "悬挂会话清理完成"),
            Err(err) => tracing::error!(error = %err, "悬挂会话清理失败"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "监听停机信号失败");
    }
}
