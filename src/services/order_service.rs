use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, FromQueryResult, JoinType,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, RelationTrait, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{CheckoutRequest, CheckoutResponse, OrderList, OrderWithItems},
    entity::{
        addresses::{Column as AddressCol, Entity as Addresses},
        cart_items::{self, Column as CartCol, Entity as CartItems},
        order_items::{
            ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems,
            Model as OrderItemModel,
        },
        orders::{
            ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel,
        },
        products::Column as ProdCol,
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{Order, OrderItem, order_status},
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    state::AppState,
};

#[derive(Debug, FromQueryResult)]
struct CartProductRow {
    product_id: Uuid,
    quantity: i32,
    price: i64,
    stock: i32,
}

pub async fn list_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let mut condition = Condition::all().add(OrderCol::UserId.eq(user.user_id));
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        condition = condition.add(OrderCol::Status.eq(status.clone()));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);

    let mut finder = Orders::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_from_entity)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        "Ok",
        OrderList { items: orders },
        Some(meta),
    ))
}

/// Snapshot the cart into a pending order and ask the gateway to prompt the
/// payer. The order is finalized later by the callback; the cart is never
/// touched here.
pub async fn initiate_checkout(
    state: &AppState,
    user: &AuthUser,
    payload: CheckoutRequest,
) -> AppResult<ApiResponse<CheckoutResponse>> {
    let phone = normalize_phone(&payload.phone)?;

    // The shipping address is an explicit parameter and a hard precondition.
    let address = Addresses::find_by_id(payload.address_id)
        .filter(AddressCol::UserId.eq(user.user_id))
        .one(&state.orm)
        .await?
        .ok_or(AppError::MissingAddress)?;

    let txn = state.orm.begin().await?;

    let rows = CartItems::find()
        .select_only()
        .column_as(CartCol::ProductId, "product_id")
        .column_as(CartCol::Quantity, "quantity")
        .column_as(ProdCol::Price, "price")
        .column_as(ProdCol::Stock, "stock")
        .join(JoinType::InnerJoin, cart_items::Relation::Products.def())
        .filter(CartCol::UserId.eq(user.user_id))
        .lock(LockType::Update)
        .into_model::<CartProductRow>()
        .all(&txn)
        .await?;

    if rows.is_empty() {
        return Err(AppError::EmptyCart);
    }

    for row in &rows {
        if row.stock < row.quantity {
            return Err(AppError::BadRequest(format!(
                "Insufficient stock for product {}",
                row.product_id
            )));
        }
    }

    let total_amount = order_total(&rows, state.shipping_cost);

    let order_id = Uuid::new_v4();
    let reference = build_order_reference(order_id);

    // Order and line items are one atomic unit: any insert failure rolls the
    // whole snapshot back when the transaction drops.
    let order = OrderActive {
        id: Set(order_id),
        user_id: Set(user.user_id),
        address_id: Set(address.id),
        reference: Set(reference.clone()),
        checkout_request_id: Set(None),
        total_amount: Set(total_amount),
        status: Set(order_status::PENDING.into()),
        paid_at: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    let mut items: Vec<OrderItem> = Vec::new();
    for row in &rows {
        let item = OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(row.product_id),
            quantity: Set(row.quantity),
            price: Set(row.price),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;
        items.push(order_item_from_entity(item));
    }

    txn.commit().await?;

    let token = match state.mpesa.access_token().await {
        Ok(token) => token,
        Err(err) => {
            mark_failed(state, order.id).await?;
            return Err(err);
        }
    };

    let description = format!("Storefront order {reference}");
    let ack = match state
        .mpesa
        .stk_push(&token, total_amount as u64, &phone, &reference, &description)
        .await
    {
        Ok(ack) => ack,
        Err(err) => {
            mark_failed(state, order.id).await?;
            return Err(err);
        }
    };

    let mut active: OrderActive = order.into();
    active.checkout_request_id = Set(ack.checkout_request_id.clone());
    let order = active.update(&state.orm).await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "checkout_initiated",
        Some("orders"),
        Some(serde_json::json!({
            "order_id": order.id,
            "reference": reference,
            "total_amount": total_amount,
        })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    tracing::info!(order_id = %order.id, reference = %order.reference, "push request accepted");

    Ok(ApiResponse::success(
        "Payment request sent, awaiting confirmation",
        CheckoutResponse {
            order: order_from_entity(order),
            items,
            customer_message: ack.customer_message,
        },
        Some(Meta::empty()),
    ))
}

pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order = Orders::find()
        .filter(
            Condition::all()
                .add(OrderCol::UserId.eq(user.user_id))
                .add(OrderCol::Id.eq(id)),
        )
        .one(&state.orm)
        .await?;
    let order = match order {
        Some(o) => o,
        None => return Err(AppError::NotFound),
    };

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_item_from_entity)
        .collect();

    Ok(ApiResponse::success(
        "OK",
        OrderWithItems {
            order: order_from_entity(order),
            items,
        },
        Some(Meta::empty()),
    ))
}

/// Move a pending order to failed after a gateway error. Guarded on the
/// current status so a callback that already finalized the order wins.
async fn mark_failed(state: &AppState, order_id: Uuid) -> AppResult<()> {
    let result = Orders::update_many()
        .col_expr(OrderCol::Status, Expr::value(order_status::FAILED))
        .col_expr(
            OrderCol::UpdatedAt,
            Expr::value(sea_orm::prelude::DateTimeWithTimeZone::from(Utc::now())),
        )
        .filter(OrderCol::Id.eq(order_id))
        .filter(OrderCol::Status.eq(order_status::PENDING))
        .exec(&state.orm)
        .await?;

    if result.rows_affected == 0 {
        tracing::warn!(%order_id, "order no longer pending, skipping failure mark");
    }
    Ok(())
}

fn order_total(rows: &[CartProductRow], shipping_cost: i64) -> i64 {
    let amount: i64 = rows
        .iter()
        .map(|row| row.price * i64::from(row.quantity))
        .sum();
    amount + shipping_cost
}

fn normalize_phone(raw: &str) -> AppResult<String> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::BadRequest("Invalid phone number".into()));
    }
    if !(10..=15).contains(&digits.len()) {
        return Err(AppError::BadRequest("Invalid phone number".into()));
    }
    Ok(digits.to_string())
}

fn build_order_reference(order_id: Uuid) -> String {
    format!("ORD-{}", order_id.simple())
}

pub(crate) fn order_from_entity(model: OrderModel) -> Order {
    Order {
        id: model.id,
        user_id: model.user_id,
        address_id: model.address_id,
        reference: model.reference,
        total_amount: model.total_amount,
        status: model.status,
        paid_at: model.paid_at.map(|dt| dt.with_timezone(&Utc)),
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    }
}

pub(crate) fn order_item_from_entity(model: OrderItemModel) -> OrderItem {
    OrderItem {
        id: model.id,
        order_id: model.order_id,
        product_id: model.product_id,
        quantity: model.quantity,
        price: model.price,
        created_at: model.created_at.with_timezone(&Utc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(quantity: i32, price: i64) -> CartProductRow {
        CartProductRow {
            product_id: Uuid::new_v4(),
            quantity,
            price,
            stock: 100,
        }
    }

    #[test]
    fn total_includes_shipping() {
        let rows = vec![row(2, 100), row(1, 50)];
        assert_eq!(order_total(&rows, 50), 350);
    }

    #[test]
    fn references_are_unique_and_opaque() {
        let a = build_order_reference(Uuid::new_v4());
        let b = build_order_reference(Uuid::new_v4());
        assert_ne!(a, b);
        assert!(a.starts_with("ORD-"));
        assert_eq!(a.len(), "ORD-".len() + 32);
    }

    #[test]
    fn phone_normalization_strips_plus_and_rejects_junk() {
        assert_eq!(normalize_phone("+254712345678").unwrap(), "254712345678");
        assert_eq!(normalize_phone("254712345678").unwrap(), "254712345678");
        assert!(normalize_phone("07-12-345").is_err());
        assert!(normalize_phone("").is_err());
        assert!(normalize_phone("12345").is_err());
    }
}
