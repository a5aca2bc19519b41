//! 设备目录仓储
//!
//! 提供用户到设备 token 的映射。注销是软删除：token 记录保留，
//! 仅置 is_active=false；同一 token 重新注册时原记录被复活并归属新用户。

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use uuid::Uuid;

use push_shared::error::Result;

use crate::models::{Device, RegisterDeviceRequest};

/// devices 表的 schema 迁移，编译期从 `migrations/` 打包进二进制，
/// 启动时经 `Database::run_migrations` 应用
pub static MIGRATOR: Migrator = sqlx::migrate!();

/// 设备目录能力面
///
/// 调度服务只依赖读取；注册/注销供 HTTP 层使用。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// 查询用户的全部活跃设备
    async fn get_by_user_id(&self, user_id: &str) -> Result<Vec<Device>>;

    /// 注册设备；token 冲突时复活并更新归属
    async fn register(&self, req: RegisterDeviceRequest) -> Result<Device>;

    /// 注销设备（软删除）；返回是否存在该 token
    async fn unregister(&self, token: &str) -> Result<bool>;
}

/// PostgreSQL 设备仓储
pub struct PgDeviceRepository {
    pool: PgPool,
}

impl PgDeviceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceRepository for PgDeviceRepository {
    async fn get_by_user_id(&self, user_id: &str) -> Result<Vec<Device>> {
        let devices = sqlx::query_as::<_, Device>(
            r#"
            SELECT id, user_id, token, platform, is_active, created_at, updated_at
            FROM devices
            WHERE user_id = $1 AND is_active = TRUE
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(devices)
    }

    async fn register(&self, req: RegisterDeviceRequest) -> Result<Device> {
        let device = sqlx::query_as::<_, Device>(
            r#"
            INSERT INTO devices (id, user_id, token, platform, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, TRUE, NOW(), NOW())
            ON CONFLICT (token) DO UPDATE
            SET user_id = EXCLUDED.user_id,
                platform = EXCLUDED.platform,
                is_active = TRUE,
                updated_at = NOW()
            RETURNING id, user_id, token, platform, is_active, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&req.user_id)
        .bind(&req.token)
        .bind(req.platform)
        .fetch_one(&self.pool)
        .await?;

        Ok(device)
    }

    async fn unregister(&self, token: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET is_active = FALSE, updated_at = NOW()
            WHERE token = $1 AND is_active = TRUE
            "#,
        )
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use push_shared::config::DatabaseConfig;
    use push_shared::database::Database;

    use crate::models::Platform;

    #[test]
    fn test_migrator_embeds_device_schema() {
        assert!(
            MIGRATOR
                .migrations
                .iter()
                .any(|m| m.description.contains("devices")),
            "迁移集中应包含 devices 表的建表脚本"
        );
    }

    /// 需要本地 Postgres
    #[tokio::test]
    #[ignore]
    async fn test_register_and_soft_delete_round_trip() {
        let db = Database::connect(&DatabaseConfig::default()).await.unwrap();
        db.run_migrations(&MIGRATOR).await.unwrap();
        let repo = PgDeviceRepository::new(db.pool().clone());

        let device = repo
            .register(RegisterDeviceRequest {
                user_id: "u-it-001".to_string(),
                token: "tok-it-001".to_string(),
                platform: Platform::Android,
            })
            .await
            .unwrap();
        assert!(device.is_active);

        let devices = repo.get_by_user_id("u-it-001").await.unwrap();
        assert!(devices.iter().any(|d| d.token == "tok-it-001"));

        assert!(repo.unregister("tok-it-001").await.unwrap());
        let devices = repo.get_by_user_id("u-it-001").await.unwrap();
        assert!(!devices.iter().any(|d| d.token == "tok-it-001"));

        // 注销不存在的 token 返回 false
        assert!(!repo.unregister("tok-it-001").await.unwrap());
    }
}
