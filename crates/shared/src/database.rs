//! PostgreSQL 连接池
//!
//! 服务启动时建池并应用 schema 迁移（迁移文件由各服务 crate 通过
//! `sqlx::migrate!` 随二进制打包），就绪探针通过 `health_check` 验证
//! 连接仍然可用。

use crate::config::DatabaseConfig;
use crate::error::Result;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

/// PostgreSQL 连接池句柄
///
/// `Clone` 只复制内部引用，可在 HTTP 状态与仓储之间自由传递。
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 按配置建立连接池
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        info!("数据库连接池已就绪");
        Ok(Self { pool })
    }

    /// 应用 schema 迁移
    ///
    /// 多实例并发启动时由 sqlx 的迁移锁保证串行执行，已应用的版本跳过。
    #[instrument(skip_all)]
    pub async fn run_migrations(&self, migrator: &Migrator) -> Result<()> {
        migrator.run(&self.pool).await?;
        info!("数据库迁移已应用");
        Ok(())
    }

    /// 仓储层持有的连接池引用
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 就绪探针用的连通性检查
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 连接真实 PostgreSQL 的冒烟测试，无数据库环境下跳过
    #[tokio::test]
    #[ignore]
    async fn test_connect_and_health_check() {
        let db = Database::connect(&DatabaseConfig::default()).await.unwrap();
        db.health_check().await.unwrap();
        db.close().await;
    }
}
