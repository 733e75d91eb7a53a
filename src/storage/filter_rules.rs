use sqlx::SqliteConnection;

use super::schema::Database;
use super::types::{DatabaseError, FilterRule, FilterRuleDbRow, NewFilterRule, RULE_COLUMNS};
use super::unit_of_work::UnitOfWork;

async fn select_enabled_rules(
    conn: &mut SqliteConnection,
) -> Result<Vec<FilterRule>, DatabaseError> {
    let rows: Vec<FilterRuleDbRow> = sqlx::query_as(&format!(
        "SELECT {RULE_COLUMNS} FROM filter_rules WHERE enabled = 1 ORDER BY priority DESC, id ASC"
    ))
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(FilterRuleDbRow::into_rule).collect()
}

impl Database {
    pub async fn create_filter_rule(&self, rule: &NewFilterRule) -> Result<FilterRule, DatabaseError> {
        let mut uow = self.begin().await?;
        let row: FilterRuleDbRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO filter_rules (name, rule_type, match_type, pattern, priority, enabled, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING {RULE_COLUMNS}
            "#
        ))
        .bind(rule.name.trim())
        .bind(rule.rule_type.as_str())
        .bind(rule.match_type.as_str())
        .bind(&rule.pattern)
        .bind(rule.priority)
        .bind(rule.enabled)
        .bind(chrono::Utc::now().timestamp())
        .fetch_one(uow.conn())
        .await?;
        uow.commit().await?;
        row.into_rule()
    }

    /// Enabled rules, highest priority first (ties by id).
    pub async fn get_enabled_rules(&self) -> Result<Vec<FilterRule>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        select_enabled_rules(&mut conn).await
    }

    pub async fn list_filter_rules(&self) -> Result<Vec<FilterRule>, DatabaseError> {
        let rows: Vec<FilterRuleDbRow> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM filter_rules ORDER BY priority DESC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FilterRuleDbRow::into_rule).collect()
    }

    /// Flip a rule's `enabled` flag, returning the new value.
    pub async fn toggle_filter_rule(&self, rule_id: i64) -> Result<bool, DatabaseError> {
        let mut uow = self.begin().await?;
        let enabled: Option<(bool,)> = sqlx::query_as(
            "UPDATE filter_rules SET enabled = NOT enabled WHERE id = ? RETURNING enabled",
        )
        .bind(rule_id)
        .fetch_optional(uow.conn())
        .await?;
        uow.commit().await?;
        enabled
            .map(|(enabled,)| enabled)
            .ok_or_else(|| DatabaseError::InvalidValue(format!("filter rule {rule_id} not found")))
    }
}

impl UnitOfWork {
    /// The rule snapshot a cycle evaluates against.
    pub async fn get_enabled_rules(&mut self) -> Result<Vec<FilterRule>, DatabaseError> {
        select_enabled_rules(self.conn()).await
    }
}
