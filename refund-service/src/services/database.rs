//! Postgres persistence for refund-service.

use crate::models::{
    AttemptStatus, AuditEvent, Currency, ExchangeRateHistory, FormStatus, Merchant,
    PaymentAttempt, Refund, RiskRule, RuleSet, SaleInvoice, SaleItem, TaxFreeForm, Traveler,
};
use crate::services::engine::ItemEligibility;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{CashCollection, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use taxfree_core::error::AppError;
use tracing::{info, instrument};
use uuid::Uuid;

const RULE_SET_COLUMNS: &str = "rule_set_id, version, min_purchase_amount, min_age, \
     purchase_window_days, exit_deadline_months, eligible_residence_countries, \
     excluded_residence_countries, excluded_categories, vat_rates, default_vat_rate, \
     fee_percentage, fixed_fee, min_operator_fee, refund_methods, risk_score_threshold, \
     high_value_threshold, is_active, activated_utc, activated_by, created_utc";

const FORM_COLUMNS: &str = "form_id, invoice_id, traveler_id, merchant_id, eligible_amount, \
     vat_amount, operator_fee, refund_amount, rule_snapshot, risk_score, risk_flags, \
     requires_control, status, expires_at, created_utc, validated_utc, validated_by";

const REFUND_COLUMNS: &str = "refund_id, form_id, gross_amount, operator_fee, net_amount, \
     method, payment_details, status, payout_currency, exchange_rate_applied, payout_amount, \
     actual_payout_amount, service_gain, service_gain_cdf, cash_collected, cash_collected_utc, \
     cash_collected_by, retry_count, max_retries, next_retry_at, cancelled_reason, cancelled_by, \
     cancelled_utc, initiated_utc, paid_utc, created_utc, updated_utc";

const CURRENCY_COLUMNS: &str =
    "code, name, symbol, exchange_rate, is_base_currency, is_active, created_utc, updated_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "refund-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl Store for Database {
    // -------------------------------------------------------------------------
    // Rule configuration
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    async fn active_rule_set(&self) -> Result<Option<RuleSet>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["active_rule_set"])
            .start_timer();

        let ruleset = sqlx::query_as::<_, RuleSet>(&format!(
            "SELECT {} FROM rule_sets WHERE is_active = TRUE",
            RULE_SET_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(ruleset)
    }

    async fn rule_set(&self, rule_set_id: Uuid) -> Result<Option<RuleSet>, AppError> {
        let ruleset = sqlx::query_as::<_, RuleSet>(&format!(
            "SELECT {} FROM rule_sets WHERE rule_set_id = $1",
            RULE_SET_COLUMNS
        ))
        .bind(rule_set_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(ruleset)
    }

    #[instrument(skip(self, ruleset), fields(version = %ruleset.version))]
    async fn insert_rule_set(&self, ruleset: &RuleSet) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_rule_set"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO rule_sets (
                rule_set_id, version, min_purchase_amount, min_age, purchase_window_days,
                exit_deadline_months, eligible_residence_countries, excluded_residence_countries,
                excluded_categories, vat_rates, default_vat_rate, fee_percentage, fixed_fee,
                min_operator_fee, refund_methods, risk_score_threshold, high_value_threshold,
                is_active, activated_utc, activated_by, created_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21)
            "#,
        )
        .bind(ruleset.rule_set_id)
        .bind(&ruleset.version)
        .bind(ruleset.min_purchase_amount)
        .bind(ruleset.min_age)
        .bind(ruleset.purchase_window_days)
        .bind(ruleset.exit_deadline_months)
        .bind(&ruleset.eligible_residence_countries)
        .bind(&ruleset.excluded_residence_countries)
        .bind(&ruleset.excluded_categories)
        .bind(&ruleset.vat_rates)
        .bind(ruleset.default_vat_rate)
        .bind(ruleset.fee_percentage)
        .bind(ruleset.fixed_fee)
        .bind(ruleset.min_operator_fee)
        .bind(&ruleset.refund_methods)
        .bind(ruleset.risk_score_threshold)
        .bind(ruleset.high_value_threshold)
        .bind(ruleset.is_active)
        .bind(ruleset.activated_utc)
        .bind(&ruleset.activated_by)
        .bind(ruleset.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "ruleset version '{}' already exists",
                    ruleset.version
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to insert ruleset: {}", e)),
        })?;

        timer.observe_duration();
        info!(rule_set_id = %ruleset.rule_set_id, version = %ruleset.version, "Ruleset created");
        Ok(())
    }

    /// Deactivate-all then activate-one inside a single transaction; there
    /// is no observable window with zero or two active rulesets.
    #[instrument(skip(self), fields(rule_set_id = %rule_set_id, actor = %actor))]
    async fn activate_rule_set(&self, rule_set_id: Uuid, actor: &str) -> Result<RuleSet, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["activate_rule_set"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query("UPDATE rule_sets SET is_active = FALSE WHERE is_active = TRUE")
            .execute(&mut *tx)
            .await?;

        let activated = sqlx::query_as::<_, RuleSet>(&format!(
            "UPDATE rule_sets SET is_active = TRUE, activated_utc = $2, activated_by = $3 \
             WHERE rule_set_id = $1 RETURNING {}",
            RULE_SET_COLUMNS
        ))
        .bind(rule_set_id)
        .bind(Utc::now())
        .bind(actor)
        .fetch_optional(&mut *tx)
        .await?;

        let ruleset = match activated {
            Some(ruleset) => ruleset,
            None => {
                tx.rollback().await.ok();
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "ruleset {} not found",
                    rule_set_id
                )));
            }
        };

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(rule_set_id = %rule_set_id, version = %ruleset.version, "Ruleset activated");
        Ok(ruleset)
    }

    async fn risk_rules(&self, rule_set_id: Uuid) -> Result<Vec<RiskRule>, AppError> {
        let rules = sqlx::query_as::<_, RiskRule>(
            "SELECT risk_rule_id, rule_set_id, name, field, operator, value, score_impact, \
             is_active, created_utc \
             FROM risk_rules WHERE rule_set_id = $1 ORDER BY created_utc",
        )
        .bind(rule_set_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    #[instrument(skip(self, rule), fields(name = %rule.name))]
    async fn insert_risk_rule(&self, rule: &RiskRule) -> Result<(), AppError> {
        // Ill-typed rules are rejected at save time, never at evaluation.
        rule.validate_value()
            .map_err(|reason| AppError::BadRequest(anyhow::anyhow!(reason)))?;

        sqlx::query(
            r#"
            INSERT INTO risk_rules (risk_rule_id, rule_set_id, name, field, operator, value,
                                    score_impact, is_active, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(rule.risk_rule_id)
        .bind(rule.rule_set_id)
        .bind(&rule.name)
        .bind(&rule.field)
        .bind(&rule.operator)
        .bind(&rule.value)
        .bind(rule.score_impact)
        .bind(rule.is_active)
        .bind(rule.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Merchants, travelers, sales
    // -------------------------------------------------------------------------

    async fn merchant(&self, merchant_id: Uuid) -> Result<Option<Merchant>, AppError> {
        let merchant = sqlx::query_as::<_, Merchant>(
            "SELECT merchant_id, name, status, created_utc FROM merchants WHERE merchant_id = $1",
        )
        .bind(merchant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(merchant)
    }

    async fn traveler(&self, traveler_id: Uuid) -> Result<Option<Traveler>, AppError> {
        let traveler = sqlx::query_as::<_, Traveler>(
            "SELECT traveler_id, full_name, date_of_birth, nationality, residence_country, \
             passport_country, passport_last4, passport_hash, created_utc \
             FROM travelers WHERE traveler_id = $1",
        )
        .bind(traveler_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(traveler)
    }

    async fn invoice(&self, invoice_id: Uuid) -> Result<Option<SaleInvoice>, AppError> {
        let invoice = sqlx::query_as::<_, SaleInvoice>(
            "SELECT invoice_id, merchant_id, traveler_id, invoice_number, total_amount, \
             is_cancelled, issued_utc, created_utc \
             FROM sale_invoices WHERE invoice_id = $1",
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }

    async fn invoice_items(&self, invoice_id: Uuid) -> Result<Vec<SaleItem>, AppError> {
        let items = sqlx::query_as::<_, SaleItem>(
            "SELECT item_id, invoice_id, category, description, quantity, unit_price, vat_rate, \
             line_total, vat_amount, is_eligible, ineligibility_reason \
             FROM sale_items WHERE invoice_id = $1 ORDER BY item_id",
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    // -------------------------------------------------------------------------
    // Tax-free forms
    // -------------------------------------------------------------------------

    async fn form(&self, form_id: Uuid) -> Result<Option<TaxFreeForm>, AppError> {
        let form = sqlx::query_as::<_, TaxFreeForm>(&format!(
            "SELECT {} FROM tax_free_forms WHERE form_id = $1",
            FORM_COLUMNS
        ))
        .bind(form_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(form)
    }

    async fn form_for_invoice(&self, invoice_id: Uuid) -> Result<Option<TaxFreeForm>, AppError> {
        let form = sqlx::query_as::<_, TaxFreeForm>(&format!(
            "SELECT {} FROM tax_free_forms WHERE invoice_id = $1",
            FORM_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(form)
    }

    async fn count_recent_forms(
        &self,
        traveler_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM tax_free_forms WHERE traveler_id = $1 AND created_utc >= $2",
        )
        .bind(traveler_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Form insert plus the item eligibility rewrite as one transaction.
    /// The item update touches only the flag and reason columns.
    #[instrument(skip(self, form, item_flags), fields(form_id = %form.form_id))]
    async fn create_form(
        &self,
        form: &TaxFreeForm,
        item_flags: &[ItemEligibility],
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_form"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO tax_free_forms (
                form_id, invoice_id, traveler_id, merchant_id, eligible_amount, vat_amount,
                operator_fee, refund_amount, rule_snapshot, risk_score, risk_flags,
                requires_control, status, expires_at, created_utc, validated_utc, validated_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(form.form_id)
        .bind(form.invoice_id)
        .bind(form.traveler_id)
        .bind(form.merchant_id)
        .bind(form.eligible_amount)
        .bind(form.vat_amount)
        .bind(form.operator_fee)
        .bind(form.refund_amount)
        .bind(&form.rule_snapshot)
        .bind(form.risk_score)
        .bind(&form.risk_flags)
        .bind(form.requires_control)
        .bind(&form.status)
        .bind(form.expires_at)
        .bind(form.created_utc)
        .bind(form.validated_utc)
        .bind(&form.validated_by)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            tx.rollback().await.ok();
            return Err(match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    AppError::Conflict(anyhow::anyhow!(
                        "invoice {} already has a tax-free form",
                        form.invoice_id
                    ))
                }
                _ => AppError::DatabaseError(anyhow::anyhow!("Failed to insert form: {}", e)),
            });
        }

        for flag in item_flags {
            sqlx::query(
                "UPDATE sale_items SET is_eligible = $2, ineligibility_reason = $3 \
                 WHERE item_id = $1",
            )
            .bind(flag.item_id)
            .bind(flag.is_eligible)
            .bind(&flag.ineligibility_reason)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    async fn transition_form(
        &self,
        form_id: Uuid,
        from: &[FormStatus],
        to: FormStatus,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let from_states: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE tax_free_forms
            SET status = $2,
                validated_utc = CASE WHEN $2 = 'validated' THEN $4 ELSE validated_utc END,
                validated_by = CASE WHEN $2 = 'validated' THEN $5 ELSE validated_by END
            WHERE form_id = $1 AND status = ANY($3)
            "#,
        )
        .bind(form_id)
        .bind(to.as_str())
        .bind(&from_states)
        .bind(now)
        .bind(actor)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // -------------------------------------------------------------------------
    // Refunds
    // -------------------------------------------------------------------------

    async fn refund(&self, refund_id: Uuid) -> Result<Option<Refund>, AppError> {
        let refund = sqlx::query_as::<_, Refund>(&format!(
            "SELECT {} FROM refunds WHERE refund_id = $1",
            REFUND_COLUMNS
        ))
        .bind(refund_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(refund)
    }

    async fn refund_for_form(&self, form_id: Uuid) -> Result<Option<Refund>, AppError> {
        let refund = sqlx::query_as::<_, Refund>(&format!(
            "SELECT {} FROM refunds WHERE form_id = $1",
            REFUND_COLUMNS
        ))
        .bind(form_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(refund)
    }

    #[instrument(skip(self, refund), fields(refund_id = %refund.refund_id))]
    async fn insert_refund(&self, refund: &Refund) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_refund"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO refunds (
                refund_id, form_id, gross_amount, operator_fee, net_amount, method,
                payment_details, status, payout_currency, exchange_rate_applied, payout_amount,
                actual_payout_amount, service_gain, service_gain_cdf, cash_collected,
                cash_collected_utc, cash_collected_by, retry_count, max_retries, next_retry_at,
                cancelled_reason, cancelled_by, cancelled_utc, initiated_utc, paid_utc,
                created_utc, updated_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)
            "#,
        )
        .bind(refund.refund_id)
        .bind(refund.form_id)
        .bind(refund.gross_amount)
        .bind(refund.operator_fee)
        .bind(refund.net_amount)
        .bind(&refund.method)
        .bind(&refund.payment_details)
        .bind(&refund.status)
        .bind(&refund.payout_currency)
        .bind(refund.exchange_rate_applied)
        .bind(refund.payout_amount)
        .bind(refund.actual_payout_amount)
        .bind(refund.service_gain)
        .bind(refund.service_gain_cdf)
        .bind(refund.cash_collected)
        .bind(refund.cash_collected_utc)
        .bind(&refund.cash_collected_by)
        .bind(refund.retry_count)
        .bind(refund.max_retries)
        .bind(refund.next_retry_at)
        .bind(&refund.cancelled_reason)
        .bind(&refund.cancelled_by)
        .bind(refund.cancelled_utc)
        .bind(refund.initiated_utc)
        .bind(refund.paid_utc)
        .bind(refund.created_utc)
        .bind(refund.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "a refund already exists for form {}",
                    refund.form_id
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to insert refund: {}", e)),
        })?;

        timer.observe_duration();
        Ok(())
    }

    /// The status check rides inside the UPDATE itself: of two concurrent
    /// claims, exactly one sees a matching row.
    async fn claim_refund_for_processing(
        &self,
        refund_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Refund>, AppError> {
        let refund = sqlx::query_as::<_, Refund>(&format!(
            "UPDATE refunds SET status = 'initiated', initiated_utc = $2, updated_utc = $2 \
             WHERE refund_id = $1 AND status IN ('pending', 'failed') RETURNING {}",
            REFUND_COLUMNS
        ))
        .bind(refund_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(refund)
    }

    async fn mark_refund_paid(
        &self,
        refund_id: Uuid,
        form_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let result = sqlx::query(
            "UPDATE refunds SET status = 'paid', paid_utc = $2, updated_utc = $2 \
             WHERE refund_id = $1 AND status = 'initiated'",
        )
        .bind(refund_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await.ok();
            return Ok(false);
        }

        sqlx::query("UPDATE tax_free_forms SET status = 'refunded' WHERE form_id = $1")
            .bind(form_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;
        Ok(true)
    }

    async fn mark_refund_failed(
        &self,
        refund_id: Uuid,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE refunds SET status = 'failed', retry_count = retry_count + 1, \
             next_retry_at = $2, updated_utc = $3 \
             WHERE refund_id = $1 AND status = 'initiated'",
        )
        .bind(refund_id)
        .bind(next_retry_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Collection figures, the PAID transition and the form's REFUNDED
    /// transition land in one transaction, guarded against a concurrent
    /// collection of the same refund.
    #[instrument(skip(self, collection), fields(refund_id = %collection.refund_id))]
    async fn record_cash_collection(&self, collection: &CashCollection) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_cash_collection"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let result = sqlx::query(
            r#"
            UPDATE refunds
            SET status = 'paid',
                actual_payout_amount = $2,
                service_gain = $3,
                service_gain_cdf = $4,
                cash_collected = TRUE,
                cash_collected_utc = $5,
                cash_collected_by = $6,
                paid_utc = $5,
                updated_utc = $5
            WHERE refund_id = $1 AND status = 'initiated' AND cash_collected = FALSE
            "#,
        )
        .bind(collection.refund_id)
        .bind(collection.actual_payout_amount)
        .bind(collection.service_gain)
        .bind(collection.service_gain_cdf)
        .bind(collection.collected_utc)
        .bind(&collection.collected_by)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await.ok();
            return Ok(false);
        }

        sqlx::query("UPDATE tax_free_forms SET status = 'refunded' WHERE form_id = $1")
            .bind(collection.form_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(true)
    }

    async fn cancel_refund(
        &self,
        refund_id: Uuid,
        reason: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE refunds SET status = 'cancelled', cancelled_reason = $2, cancelled_by = $3, \
             cancelled_utc = $4, updated_utc = $4 \
             WHERE refund_id = $1 AND status IN ('pending', 'failed')",
        )
        .bind(refund_id)
        .bind(reason)
        .bind(actor)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn refunds_due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Refund>, AppError> {
        let refunds = sqlx::query_as::<_, Refund>(&format!(
            "SELECT {} FROM refunds \
             WHERE status = 'failed' AND retry_count < max_retries \
               AND (next_retry_at IS NULL OR next_retry_at <= $1) \
             ORDER BY next_retry_at",
            REFUND_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(refunds)
    }

    // -------------------------------------------------------------------------
    // Payment attempts
    // -------------------------------------------------------------------------

    async fn insert_payment_attempt(&self, attempt: &PaymentAttempt) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO payment_attempts (attempt_id, refund_id, provider, request_payload,
                                          response_payload, status, error_code, error_message,
                                          started_utc, completed_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(attempt.attempt_id)
        .bind(attempt.refund_id)
        .bind(&attempt.provider)
        .bind(&attempt.request_payload)
        .bind(&attempt.response_payload)
        .bind(&attempt.status)
        .bind(&attempt.error_code)
        .bind(&attempt.error_message)
        .bind(attempt.started_utc)
        .bind(attempt.completed_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Completed attempts are append-only: the guard refuses a second
    /// completion instead of overwriting the first.
    async fn complete_payment_attempt(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        response: Option<Value>,
        error_code: Option<String>,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE payment_attempts SET status = $2, response_payload = $3, error_code = $4, \
             error_message = $5, completed_utc = $6 \
             WHERE attempt_id = $1 AND completed_utc IS NULL",
        )
        .bind(attempt_id)
        .bind(status.as_str())
        .bind(response)
        .bind(error_code)
        .bind(error_message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "payment attempt {} is already completed",
                attempt_id
            )));
        }
        Ok(())
    }

    async fn payment_attempts(&self, refund_id: Uuid) -> Result<Vec<PaymentAttempt>, AppError> {
        let attempts = sqlx::query_as::<_, PaymentAttempt>(
            "SELECT attempt_id, refund_id, provider, request_payload, response_payload, status, \
             error_code, error_message, started_utc, completed_utc \
             FROM payment_attempts WHERE refund_id = $1 ORDER BY started_utc",
        )
        .bind(refund_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    // -------------------------------------------------------------------------
    // Currencies
    // -------------------------------------------------------------------------

    async fn currency(&self, code: &str) -> Result<Option<Currency>, AppError> {
        let currency = sqlx::query_as::<_, Currency>(&format!(
            "SELECT {} FROM currencies WHERE code = $1",
            CURRENCY_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(currency)
    }

    async fn base_currency(&self) -> Result<Option<Currency>, AppError> {
        let currency = sqlx::query_as::<_, Currency>(&format!(
            "SELECT {} FROM currencies WHERE is_base_currency = TRUE",
            CURRENCY_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(currency)
    }

    async fn insert_currency(&self, currency: &Currency) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO currencies (code, name, symbol, exchange_rate, is_base_currency,
                                    is_active, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&currency.code)
        .bind(&currency.name)
        .bind(&currency.symbol)
        .bind(currency.exchange_rate)
        .bind(currency.is_base_currency)
        .bind(currency.is_active)
        .bind(currency.created_utc)
        .bind(currency.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!("currency '{}' already exists", currency.code))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to insert currency: {}", e)),
        })?;
        Ok(())
    }

    /// Flag swap and forced rate of exactly 1 in one transaction; no window
    /// with zero or two base currencies.
    #[instrument(skip(self), fields(code = %code))]
    async fn set_base_currency(&self, code: &str, actor: &str) -> Result<Currency, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_base_currency"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let old_rate = sqlx::query_scalar::<_, Decimal>(
            "SELECT exchange_rate FROM currencies WHERE code = $1 FOR UPDATE",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;

        let old_rate = match old_rate {
            Some(rate) => rate,
            None => {
                tx.rollback().await.ok();
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "currency '{}' does not exist",
                    code
                )));
            }
        };

        sqlx::query(
            "UPDATE currencies SET is_base_currency = FALSE WHERE is_base_currency = TRUE AND code <> $1",
        )
        .bind(code)
        .execute(&mut *tx)
        .await?;

        let now = Utc::now();
        let updated = sqlx::query_as::<_, Currency>(&format!(
            "UPDATE currencies SET is_base_currency = TRUE, exchange_rate = 1, updated_utc = $2 \
             WHERE code = $1 RETURNING {}",
            CURRENCY_COLUMNS
        ))
        .bind(code)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        if old_rate != Decimal::ONE {
            sqlx::query(
                r#"
                INSERT INTO exchange_rate_history (history_id, currency_code, old_rate, new_rate,
                                                   changed_by, reason, created_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(code)
            .bind(old_rate)
            .bind(Decimal::ONE)
            .bind(actor)
            .bind("base currency change")
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(updated)
    }

    /// Rate update and its history row are one atomic unit.
    #[instrument(skip(self), fields(code = %code))]
    async fn update_exchange_rate(
        &self,
        code: &str,
        new_rate: Decimal,
        actor: &str,
        reason: &str,
    ) -> Result<Currency, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_exchange_rate"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let old_rate = sqlx::query_scalar::<_, Decimal>(
            "SELECT exchange_rate FROM currencies WHERE code = $1 FOR UPDATE",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;

        let old_rate = match old_rate {
            Some(rate) => rate,
            None => {
                tx.rollback().await.ok();
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "currency '{}' does not exist",
                    code
                )));
            }
        };

        let now = Utc::now();
        let updated = sqlx::query_as::<_, Currency>(&format!(
            "UPDATE currencies SET exchange_rate = $2, updated_utc = $3 \
             WHERE code = $1 RETURNING {}",
            CURRENCY_COLUMNS
        ))
        .bind(code)
        .bind(new_rate)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO exchange_rate_history (history_id, currency_code, old_rate, new_rate,
                                               changed_by, reason, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(code)
        .bind(old_rate)
        .bind(new_rate)
        .bind(actor)
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(updated)
    }

    async fn rate_history(&self, code: &str) -> Result<Vec<ExchangeRateHistory>, AppError> {
        let history = sqlx::query_as::<_, ExchangeRateHistory>(
            "SELECT history_id, currency_code, old_rate, new_rate, changed_by, reason, \
             created_utc \
             FROM exchange_rate_history WHERE currency_code = $1 ORDER BY created_utc",
        )
        .bind(code)
        .fetch_all(&self.pool)
        .await?;
        Ok(history)
    }

    // -------------------------------------------------------------------------
    // Audit
    // -------------------------------------------------------------------------

    async fn append_audit(&self, event: &AuditEvent) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (event_id, event_type, entity_type, entity_id, actor,
                                      detail, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.event_id)
        .bind(&event.event_type)
        .bind(&event.entity_type)
        .bind(&event.entity_id)
        .bind(&event.actor)
        .bind(&event.detail)
        .bind(event.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
