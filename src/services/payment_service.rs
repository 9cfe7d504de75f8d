use chrono::Utc;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QuerySelect, Set,
    TransactionTrait,
};

use crate::{
    audit::log_audit,
    dto::payments::{CallbackAck, RESULT_SUCCESS, StkCallbackEnvelope},
    entity::{
        cart_items::{Column as CartCol, Entity as CartItems},
        order_items::{Column as OrderItemCol, Entity as OrderItems},
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel},
        products::{Column as ProdCol, Entity as Products},
    },
    error::{AppError, AppResult},
    models::order_status,
    state::AppState,
};

/// Resolve an out-of-band gateway confirmation against its originating
/// order. Safe under duplicate delivery: the order row is locked, the status
/// is checked before any write, and terminal states are never reversed.
pub async fn resolve_callback(
    state: &AppState,
    payload: StkCallbackEnvelope,
) -> AppResult<CallbackAck> {
    let callback = payload.body.stk_callback;
    let reference = callback.account_reference();
    let checkout_request_id = callback.checkout_request_id.clone();

    if reference.is_none() && checkout_request_id.is_none() {
        return Err(AppError::MalformedCallback(
            "neither AccountReference nor CheckoutRequestID present".into(),
        ));
    }

    let txn = state.orm.begin().await?;

    // Row lock serializes concurrent deliveries for the same order.
    let mut order = match reference.as_deref() {
        Some(r) => {
            Orders::find()
                .filter(OrderCol::Reference.eq(r))
                .lock(LockType::Update)
                .one(&txn)
                .await?
        }
        None => None,
    };
    // Failure callbacks carry no metadata; fall back to the push
    // acknowledgment id recorded at checkout.
    if order.is_none() {
        if let Some(id) = checkout_request_id.as_deref() {
            order = Orders::find()
                .filter(OrderCol::CheckoutRequestId.eq(id))
                .lock(LockType::Update)
                .one(&txn)
                .await?;
        }
    }
    let order = order.ok_or(AppError::UnknownOrder)?;

    let order_id = order.id;
    let user_id = order.user_id;
    let status = order.status.clone();
    let success = callback.result_code == RESULT_SUCCESS;

    let action = match (success, status.as_str()) {
        (true, order_status::PENDING) => {
            finalize_paid(&txn, order).await?;
            "payment_paid"
        }
        (true, order_status::PAID) => "payment_duplicate_ack",
        (false, order_status::PENDING) => {
            finalize_failed(&txn, order).await?;
            "payment_failed"
        }
        (false, order_status::FAILED) => "payment_duplicate_ack",
        _ => {
            tracing::warn!(
                %order_id,
                %status,
                result_code = callback.result_code,
                "callback conflicts with terminal order status, ignoring"
            );
            "payment_conflicting_callback"
        }
    };

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user_id),
        action,
        Some("orders"),
        Some(serde_json::json!({
            "order_id": order_id,
            "result_code": callback.result_code,
            "result_desc": callback.result_desc,
        })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    tracing::info!(
        %order_id,
        result_code = callback.result_code,
        action,
        "payment callback resolved"
    );

    Ok(CallbackAck::accepted())
}

async fn finalize_paid(txn: &DatabaseTransaction, order: OrderModel) -> AppResult<()> {
    let order_id = order.id;
    let user_id = order.user_id;
    let now = Utc::now();

    let mut active: OrderActive = order.into();
    active.status = Set(order_status::PAID.into());
    active.paid_at = Set(Some(now.into()));
    active.updated_at = Set(now.into());
    active.update(txn).await?;

    // Stock is committed only once payment clears.
    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order_id))
        .all(txn)
        .await?;
    for item in &items {
        Products::update_many()
            .col_expr(ProdCol::Stock, Expr::col(ProdCol::Stock).sub(item.quantity))
            .filter(ProdCol::Id.eq(item.product_id))
            .exec(txn)
            .await?;
    }

    // Scoped to the order's owner; other users' carts are untouched.
    CartItems::delete_many()
        .filter(CartCol::UserId.eq(user_id))
        .exec(txn)
        .await?;

    Ok(())
}

async fn finalize_failed(txn: &DatabaseTransaction, order: OrderModel) -> AppResult<()> {
    let mut active: OrderActive = order.into();
    active.status = Set(order_status::FAILED.into());
    active.updated_at = Set(Utc::now().into());
    active.update(txn).await?;
    Ok(())
}
