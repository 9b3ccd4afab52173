use redis::Client;
use redis::aio::ConnectionManager;

/// Open the Redis connection that holds dispatch claims and stored outcomes.
///
/// Issues a `PING` so a misconfigured URL fails at startup rather than on the
/// first admission check.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;

    let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
    tracing::info!(reply = %pong, "Connected to Redis");
    Ok(manager)
}
