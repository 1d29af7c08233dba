use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgConnection;
use uuid::Uuid;

use super::models::{
    ExchangeRateRow, PayoutItemRow, PayoutRow, TransactionRow, WebhookEventRow,
};
use crate::domain::{
    ExchangeRateSnapshot, Payout, PayoutItem, Transaction, TransactionStatus, WebhookEvent,
};
use crate::error::SettlementError;

type Result<T> = std::result::Result<T, SettlementError>;

fn collect<R, T>(
    rows: Vec<R>,
    convert: impl Fn(R) -> Result<T>,
) -> Result<Vec<T>> {
    rows.into_iter().map(convert).collect()
}

// --- Transaction queries ---

/// Inserts a transaction unless one already exists for the (order, seller)
/// pair. Returns whether a row was written.
pub async fn insert_transaction_if_absent(conn: &mut PgConnection, tx: &Transaction) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO transactions (
            id, order_id, seller_id, buyer_id, payment_reference,
            gross_amount, platform_fee, provider_fee, net_amount, currency,
            status, status_changed_at, notes, metadata, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (order_id, seller_id) DO NOTHING
        "#,
    )
    .bind(tx.id)
    .bind(tx.order_id)
    .bind(tx.seller_id)
    .bind(tx.buyer_id)
    .bind(&tx.payment_reference)
    .bind(tx.amounts.gross_amount())
    .bind(tx.amounts.platform_fee())
    .bind(tx.amounts.provider_fee())
    .bind(tx.amounts.net_amount())
    .bind(&tx.currency)
    .bind(tx.status.as_str())
    .bind(tx.status_changed_at)
    .bind(Json(&tx.notes))
    .bind(&tx.metadata)
    .bind(tx.created_at)
    .bind(tx.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Writes back every mutable column of a transaction loaded earlier in the
/// same unit of work.
pub async fn save_transaction(conn: &mut PgConnection, tx: &Transaction) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE transactions SET
            payment_reference = $2,
            transfer_reference = $3,
            refund_reference = $4,
            platform_fee = $5,
            provider_fee = $6,
            net_amount = $7,
            refund_amount = $8,
            status = $9,
            hold_reason = $10,
            payment_received_at = $11,
            hold_started_at = $12,
            planned_release_at = $13,
            actual_release_at = COALESCE(actual_release_at, $14),
            payout_claimed = $15,
            transfer_retry_count = $16,
            status_changed_at = $17,
            notes = $18,
            metadata = $19,
            updated_at = $20
        WHERE id = $1
        "#,
    )
    .bind(tx.id)
    .bind(&tx.payment_reference)
    .bind(&tx.transfer_reference)
    .bind(&tx.refund_reference)
    .bind(tx.amounts.platform_fee())
    .bind(tx.amounts.provider_fee())
    .bind(tx.amounts.net_amount())
    .bind(&tx.refund_amount)
    .bind(tx.status.as_str())
    .bind(&tx.hold_reason)
    .bind(tx.payment_received_at)
    .bind(tx.hold_started_at)
    .bind(tx.planned_release_at)
    .bind(tx.actual_release_at)
    .bind(tx.payout_claimed)
    .bind(tx.transfer_retry_count)
    .bind(tx.status_changed_at)
    .bind(Json(&tx.notes))
    .bind(&tx.metadata)
    .bind(tx.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn get_transaction(conn: &mut PgConnection, id: Uuid) -> Result<Option<Transaction>> {
    sqlx::query_as::<_, TransactionRow>("SELECT * FROM transactions WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(TransactionRow::into_domain)
        .transpose()
}

pub async fn lock_transaction(conn: &mut PgConnection, id: Uuid) -> Result<Option<Transaction>> {
    sqlx::query_as::<_, TransactionRow>("SELECT * FROM transactions WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(TransactionRow::into_domain)
        .transpose()
}

/// Locks a set of transactions in id order.
pub async fn lock_transactions(conn: &mut PgConnection, ids: &[Uuid]) -> Result<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, TransactionRow>(
        "SELECT * FROM transactions WHERE id = ANY($1) ORDER BY id FOR UPDATE",
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await?;

    collect(rows, TransactionRow::into_domain)
}

pub async fn list_transactions_for_order(
    conn: &mut PgConnection,
    order_id: Uuid,
) -> Result<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, TransactionRow>(
        "SELECT * FROM transactions WHERE order_id = $1 ORDER BY id",
    )
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await?;

    collect(rows, TransactionRow::into_domain)
}

pub async fn lock_transactions_for_order(
    conn: &mut PgConnection,
    order_id: Uuid,
) -> Result<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, TransactionRow>(
        "SELECT * FROM transactions WHERE order_id = $1 ORDER BY id FOR UPDATE",
    )
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await?;

    collect(rows, TransactionRow::into_domain)
}

pub async fn lock_transaction_by_transfer_reference(
    conn: &mut PgConnection,
    reference: &str,
) -> Result<Option<Transaction>> {
    sqlx::query_as::<_, TransactionRow>(
        "SELECT * FROM transactions WHERE transfer_reference = $1 FOR UPDATE",
    )
    .bind(reference)
    .fetch_optional(&mut *conn)
    .await?
    .map(TransactionRow::into_domain)
    .transpose()
}

pub async fn lock_transaction_by_refund_reference(
    conn: &mut PgConnection,
    reference: &str,
) -> Result<Option<Transaction>> {
    sqlx::query_as::<_, TransactionRow>(
        "SELECT * FROM transactions WHERE refund_reference = $1 FOR UPDATE",
    )
    .bind(reference)
    .fetch_optional(&mut *conn)
    .await?
    .map(TransactionRow::into_domain)
    .transpose()
}

pub async fn list_seller_transactions_by_status(
    conn: &mut PgConnection,
    seller_id: Uuid,
    status: TransactionStatus,
) -> Result<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, TransactionRow>(
        r#"
        SELECT * FROM transactions
        WHERE seller_id = $1 AND status = $2
        ORDER BY planned_release_at ASC NULLS LAST, id
        "#,
    )
    .bind(seller_id)
    .bind(status.as_str())
    .fetch_all(&mut *conn)
    .await?;

    collect(rows, TransactionRow::into_domain)
}

/// Held transactions of a seller whose planned release has passed.
pub async fn list_ready_for_release(
    conn: &mut PgConnection,
    seller_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, TransactionRow>(
        r#"
        SELECT * FROM transactions
        WHERE seller_id = $1 AND status = 'held' AND planned_release_at <= $2
        ORDER BY planned_release_at ASC, id
        "#,
    )
    .bind(seller_id)
    .bind(now)
    .fetch_all(&mut *conn)
    .await?;

    collect(rows, TransactionRow::into_domain)
}

/// Unclaimed transactions that have been released from hold, by status or by
/// an actual release timestamp.
pub async fn select_eligible_transactions(
    conn: &mut PgConnection,
    seller_id: Uuid,
) -> Result<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, TransactionRow>(
        r#"
        SELECT * FROM transactions
        WHERE seller_id = $1
          AND payout_claimed = FALSE
          AND (status = 'released' OR actual_release_at IS NOT NULL)
        ORDER BY id
        "#,
    )
    .bind(seller_id)
    .fetch_all(&mut *conn)
    .await?;

    collect(rows, TransactionRow::into_domain)
}

/// Locks the rows a payout batch for one seller and currency may claim:
/// eligible transactions plus transfers already in flight.
pub async fn lock_payout_candidates(
    conn: &mut PgConnection,
    seller_id: Uuid,
    currency: &str,
) -> Result<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, TransactionRow>(
        r#"
        SELECT * FROM transactions
        WHERE seller_id = $1
          AND currency = $2
          AND payout_claimed = FALSE
          AND (
                status = 'released'
                OR actual_release_at IS NOT NULL
                OR (status = 'processing' AND transfer_reference IS NOT NULL)
          )
        ORDER BY id
        FOR UPDATE
        "#,
    )
    .bind(seller_id)
    .bind(currency)
    .fetch_all(&mut *conn)
    .await?;

    collect(rows, TransactionRow::into_domain)
}

/// Currencies in which the seller has unclaimed, payable transactions.
pub async fn payout_candidate_currencies(
    conn: &mut PgConnection,
    seller_id: Uuid,
) -> Result<Vec<String>> {
    let currencies = sqlx::query_scalar::<_, String>(
        r#"
        SELECT DISTINCT currency FROM transactions
        WHERE seller_id = $1
          AND payout_claimed = FALSE
          AND (
                status = 'released'
                OR actual_release_at IS NOT NULL
                OR (status = 'processing' AND transfer_reference IS NOT NULL)
          )
        ORDER BY currency
        "#,
    )
    .bind(seller_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(currencies)
}

// --- Payout queries ---

pub async fn insert_payout(conn: &mut PgConnection, payout: &Payout) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO payouts (
            id, seller_id, provider_payout_id, destination_account, idempotency_key,
            total_amount, currency, fee_total, status, failure_code, failure_message,
            arrival_date, reconciliation_status, retry_count, status_history,
            created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        "#,
    )
    .bind(payout.id)
    .bind(payout.seller_id)
    .bind(&payout.provider_payout_id)
    .bind(&payout.destination_account)
    .bind(&payout.idempotency_key)
    .bind(&payout.total_amount)
    .bind(&payout.currency)
    .bind(&payout.fee_total)
    .bind(payout.status.as_str())
    .bind(&payout.failure_code)
    .bind(&payout.failure_message)
    .bind(payout.arrival_date)
    .bind(payout.reconciliation_status.as_str())
    .bind(payout.retry_count)
    .bind(Json(&payout.status_history))
    .bind(payout.created_at)
    .bind(payout.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn save_payout(conn: &mut PgConnection, payout: &Payout) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE payouts SET
            provider_payout_id = $2,
            status = $3,
            failure_code = $4,
            failure_message = $5,
            arrival_date = $6,
            reconciliation_status = $7,
            retry_count = $8,
            status_history = $9,
            updated_at = $10
        WHERE id = $1
        "#,
    )
    .bind(payout.id)
    .bind(&payout.provider_payout_id)
    .bind(payout.status.as_str())
    .bind(&payout.failure_code)
    .bind(&payout.failure_message)
    .bind(payout.arrival_date)
    .bind(payout.reconciliation_status.as_str())
    .bind(payout.retry_count)
    .bind(Json(&payout.status_history))
    .bind(payout.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn get_payout(conn: &mut PgConnection, id: Uuid) -> Result<Option<Payout>> {
    sqlx::query_as::<_, PayoutRow>("SELECT * FROM payouts WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(PayoutRow::into_domain)
        .transpose()
}

pub async fn lock_payout(conn: &mut PgConnection, id: Uuid) -> Result<Option<Payout>> {
    sqlx::query_as::<_, PayoutRow>("SELECT * FROM payouts WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(PayoutRow::into_domain)
        .transpose()
}

pub async fn find_payout_id_by_provider_id(
    conn: &mut PgConnection,
    provider_payout_id: &str,
) -> Result<Option<Uuid>> {
    let id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM payouts WHERE provider_payout_id = $1")
        .bind(provider_payout_id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(id)
}

pub async fn list_seller_payouts(conn: &mut PgConnection, seller_id: Uuid) -> Result<Vec<Payout>> {
    let rows = sqlx::query_as::<_, PayoutRow>(
        "SELECT * FROM payouts WHERE seller_id = $1 ORDER BY created_at DESC",
    )
    .bind(seller_id)
    .fetch_all(&mut *conn)
    .await?;

    collect(rows, PayoutRow::into_domain)
}

pub async fn insert_payout_item(conn: &mut PgConnection, item: &PayoutItem) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO payout_items (
            id, payout_id, transaction_id, order_id, amount, currency, status, paid_at, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(item.id)
    .bind(item.payout_id)
    .bind(item.transaction_id)
    .bind(item.order_id)
    .bind(&item.amount)
    .bind(&item.currency)
    .bind(item.status.as_str())
    .bind(item.paid_at)
    .bind(item.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn list_payout_items(conn: &mut PgConnection, payout_id: Uuid) -> Result<Vec<PayoutItem>> {
    let rows = sqlx::query_as::<_, PayoutItemRow>(
        "SELECT * FROM payout_items WHERE payout_id = $1 ORDER BY transaction_id",
    )
    .bind(payout_id)
    .fetch_all(&mut *conn)
    .await?;

    collect(rows, PayoutItemRow::into_domain)
}

pub async fn lock_payout_items(conn: &mut PgConnection, payout_id: Uuid) -> Result<Vec<PayoutItem>> {
    let rows = sqlx::query_as::<_, PayoutItemRow>(
        "SELECT * FROM payout_items WHERE payout_id = $1 ORDER BY id FOR UPDATE",
    )
    .bind(payout_id)
    .fetch_all(&mut *conn)
    .await?;

    collect(rows, PayoutItemRow::into_domain)
}

/// Transactions referenced by a payout. Read without locks so callers can
/// lock transactions before the payout.
pub async fn payout_transaction_ids(conn: &mut PgConnection, payout_id: Uuid) -> Result<Vec<Uuid>> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        "SELECT transaction_id FROM payout_items WHERE payout_id = $1 ORDER BY transaction_id",
    )
    .bind(payout_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(ids)
}

/// Payout items ever recorded for the given transactions, voided ones included.
pub async fn count_payout_items_for_transactions(
    conn: &mut PgConnection,
    transaction_ids: &[Uuid],
) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM payout_items WHERE transaction_id = ANY($1)",
    )
    .bind(transaction_ids)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count)
}

/// The payout currently owning a transaction, if any.
pub async fn active_payout_for_transaction(
    conn: &mut PgConnection,
    transaction_id: Uuid,
) -> Result<Option<Uuid>> {
    let id = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT pi.payout_id FROM payout_items pi
        JOIN payouts p ON p.id = pi.payout_id
        WHERE pi.transaction_id = $1
          AND pi.status <> 'voided'
          AND p.status NOT IN ('failed', 'canceled')
        ORDER BY pi.created_at DESC
        LIMIT 1
        "#,
    )
    .bind(transaction_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(id)
}

/// Marks the live payout item of a transaction paid. Returns rows touched.
pub async fn mark_payout_items_paid(
    conn: &mut PgConnection,
    transaction_id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE payout_items SET status = 'paid', paid_at = $2
        WHERE transaction_id = $1
          AND status = 'pending'
          AND payout_id IN (SELECT id FROM payouts WHERE status NOT IN ('failed', 'canceled'))
        "#,
    )
    .bind(transaction_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Voids the pending payout items of a transaction; rows stay for audit.
pub async fn void_payout_items(conn: &mut PgConnection, transaction_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE payout_items SET status = 'voided' WHERE transaction_id = $1 AND status = 'pending'",
    )
    .bind(transaction_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

// --- Webhook event queries ---

/// Claims an event for processing. Returns `None` when another delivery has
/// already processed it or is processing it right now.
pub async fn claim_webhook_event(
    conn: &mut PgConnection,
    external_event_id: &str,
    event_type: &str,
    payload: &serde_json::Value,
    client_id: Option<&str>,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
) -> Result<Option<WebhookEvent>> {
    sqlx::query_as::<_, WebhookEventRow>(
        r#"
        INSERT INTO webhook_events (
            id, external_event_id, event_type, payload, status, attempts,
            client_id, received_at, updated_at
        ) VALUES ($1, $2, $3, $4, 'processing', 1, $5, $6, $6)
        ON CONFLICT (external_event_id) DO UPDATE
            SET status = 'processing',
                attempts = webhook_events.attempts + 1,
                updated_at = EXCLUDED.updated_at
            WHERE webhook_events.status NOT IN ('processed', 'processing')
               OR (webhook_events.status = 'processing' AND webhook_events.updated_at < $7)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(external_event_id)
    .bind(event_type)
    .bind(payload)
    .bind(client_id)
    .bind(now)
    .bind(stale_before)
    .fetch_optional(&mut *conn)
    .await?
    .map(WebhookEventRow::into_domain)
    .transpose()
}

pub async fn get_webhook_event(
    conn: &mut PgConnection,
    external_event_id: &str,
) -> Result<Option<WebhookEvent>> {
    sqlx::query_as::<_, WebhookEventRow>(
        "SELECT * FROM webhook_events WHERE external_event_id = $1",
    )
    .bind(external_event_id)
    .fetch_optional(&mut *conn)
    .await?
    .map(WebhookEventRow::into_domain)
    .transpose()
}

pub async fn mark_webhook_processed(
    conn: &mut PgConnection,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE webhook_events
        SET status = 'processed', processed_at = $2, last_error = NULL, updated_at = $2
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn mark_webhook_ignored(conn: &mut PgConnection, id: Uuid, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE webhook_events SET status = 'ignored', updated_at = $2 WHERE id = $1")
        .bind(id)
        .bind(now)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub async fn mark_webhook_failed(
    conn: &mut PgConnection,
    id: Uuid,
    error: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE webhook_events SET status = 'failed', last_error = $2, updated_at = $3 WHERE id = $1",
    )
    .bind(id)
    .bind(error)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

// --- Exchange rate queries ---

pub async fn insert_exchange_rate(
    conn: &mut PgConnection,
    snapshot: &ExchangeRateSnapshot,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO exchange_rates (id, base_currency, target_currency, rate, captured_at, source)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(snapshot.id)
    .bind(&snapshot.base_currency)
    .bind(&snapshot.target_currency)
    .bind(&snapshot.rate)
    .bind(snapshot.captured_at)
    .bind(&snapshot.source)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Latest snapshot for a currency pair in either direction.
pub async fn latest_exchange_rate(
    conn: &mut PgConnection,
    from: &str,
    to: &str,
) -> Result<Option<ExchangeRateSnapshot>> {
    let row = sqlx::query_as::<_, ExchangeRateRow>(
        r#"
        SELECT id, base_currency, target_currency, rate, captured_at, source
        FROM exchange_rates
        WHERE (base_currency = $1 AND target_currency = $2)
           OR (base_currency = $2 AND target_currency = $1)
        ORDER BY captured_at DESC
        LIMIT 1
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(ExchangeRateRow::into_domain))
}
