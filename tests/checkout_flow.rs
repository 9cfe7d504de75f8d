use axum_storefront_api::{
    db::{create_orm_conn, create_pool, run_migrations},
    dto::{cart::AddToCartRequest, orders::CheckoutRequest, payments::StkCallbackEnvelope},
    entity::{
        addresses::ActiveModel as AddressActive,
        orders::Entity as Orders,
        products::{ActiveModel as ProductActive, Entity as Products},
        users::ActiveModel as UserActive,
    },
    error::AppError,
    middleware::auth::AuthUser,
    models::order_status,
    mpesa::{MpesaClient, MpesaConfig},
    services::{cart_service, order_service, payment_service},
    state::AppState,
};
use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// Integration flow for the reconciliation core: cart snapshot -> pending
// order -> STK push against a mocked gateway -> callback settlement.
// Requires a database; skipped when none is configured.

async fn try_setup_state(gateway_url: &str) -> anyhow::Result<Option<AppState>> {
    let database_url =
        match std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
            Ok(url) => url,
            Err(_) => {
                eprintln!(
                    "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
                );
                return Ok(None);
            }
        };

    let pool = create_pool(&database_url).await?;
    let orm = create_orm_conn(&database_url).await?;
    run_migrations(&orm).await?;

    let mpesa = MpesaClient::new(MpesaConfig {
        base_url: gateway_url.trim_end_matches('/').to_string(),
        consumer_key: "test-key".into(),
        consumer_secret: "test-secret".into(),
        shortcode: "174379".into(),
        passkey: "test-passkey".into(),
        callback_url: "https://example.com/api/payments/mpesa/callback".into(),
        timeout_secs: 5,
    })?;

    Ok(Some(AppState {
        pool,
        orm,
        mpesa,
        shipping_cost: 50,
    }))
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/oauth/v1/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "test-token",
            "expires_in": "3599"
        })))
        .mount(server)
        .await;
}

async fn mount_push_accepted(server: &MockServer, checkout_request_id: &str) {
    Mock::given(method("POST"))
        .and(path("/stkpush/v1/processrequest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": checkout_request_id,
            "ResponseCode": "0",
            "ResponseDescription": "Success. Request accepted for processing",
            "CustomerMessage": "Success. Request accepted for processing"
        })))
        .mount(server)
        .await;
}

async fn create_user(state: &AppState, role: &str) -> anyhow::Result<AuthUser> {
    let user = UserActive {
        id: Set(Uuid::new_v4()),
        email: Set(format!("user-{}@example.com", Uuid::new_v4())),
        password_hash: Set("dummy".into()),
        role: Set(role.into()),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(AuthUser {
        user_id: user.id,
        role: role.into(),
    })
}

async fn create_address(state: &AppState, user: &AuthUser) -> anyhow::Result<Uuid> {
    let address = AddressActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(user.user_id),
        locality: Set("Kimathi Street".into()),
        city: Set("Nairobi".into()),
        state: Set("Nairobi County".into()),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    Ok(address.id)
}

async fn create_product(state: &AppState, price: i64, stock: i32) -> anyhow::Result<Uuid> {
    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set(format!("Test Widget {}", Uuid::new_v4())),
        description: Set(Some("A product for testing".into())),
        price: Set(price),
        stock: Set(stock),
        is_active: Set(true),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    Ok(product.id)
}

async fn add_cart_line(
    state: &AppState,
    user: &AuthUser,
    product_id: Uuid,
    quantity: i32,
) -> anyhow::Result<()> {
    cart_service::add_to_cart(
        &state.pool,
        user,
        AddToCartRequest {
            product_id,
            quantity,
        },
    )
    .await?;
    Ok(())
}

async fn cart_len(state: &AppState, user: &AuthUser) -> anyhow::Result<i64> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cart_items WHERE user_id = $1")
        .bind(user.user_id)
        .fetch_one(&state.pool)
        .await?;
    Ok(count.0)
}

fn success_callback(reference: &str, checkout_request_id: &str) -> StkCallbackEnvelope {
    serde_json::from_value(serde_json::json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        {"Name": "Amount", "Value": 350},
                        {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                        {"Name": "AccountReference", "Value": reference}
                    ]
                }
            }
        }
    }))
    .expect("valid callback payload")
}

fn failure_callback(checkout_request_id: &str, result_code: i64) -> StkCallbackEnvelope {
    serde_json::from_value(serde_json::json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-2",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": result_code,
                "ResultDesc": "Request cancelled by user"
            }
        }
    }))
    .expect("valid callback payload")
}

#[tokio::test]
async fn checkout_then_success_callback_settles_order_once() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let push_id = format!("ws_CO_{}", Uuid::new_v4().simple());
    mount_token(&server).await;
    mount_push_accepted(&server, &push_id).await;

    let state = match try_setup_state(&server.uri()).await? {
        Some(state) => state,
        None => return Ok(()),
    };

    let buyer = create_user(&state, "user").await?;
    let bystander = create_user(&state, "user").await?;
    let address_id = create_address(&state, &buyer).await?;

    let product_a = create_product(&state, 100, 10).await?;
    let product_b = create_product(&state, 50, 5).await?;

    add_cart_line(&state, &buyer, product_a, 2).await?;
    add_cart_line(&state, &buyer, product_b, 1).await?;
    add_cart_line(&state, &bystander, product_a, 1).await?;

    let resp = order_service::initiate_checkout(
        &state,
        &buyer,
        CheckoutRequest {
            address_id,
            phone: "254712345678".into(),
        },
    )
    .await?;
    let checkout = resp.data.expect("checkout data");
    let order = checkout.order;

    assert_eq!(order.status, order_status::PENDING);
    assert_eq!(order.total_amount, 350);
    assert_eq!(checkout.items.len(), 2);
    assert!(order.reference.starts_with("ORD-"));
    // The push does not touch the cart.
    assert_eq!(cart_len(&state, &buyer).await?, 2);

    // A later catalog price change must not affect the recorded order.
    let product = Products::find_by_id(product_a)
        .one(&state.orm)
        .await?
        .expect("product");
    let mut active: ProductActive = product.into();
    active.price = Set(999);
    active.update(&state.orm).await?;

    let ack = payment_service::resolve_callback(
        &state,
        success_callback(&order.reference, &push_id),
    )
    .await?;
    assert_eq!(ack.result_code, 0);

    let settled = Orders::find_by_id(order.id)
        .one(&state.orm)
        .await?
        .expect("order");
    assert_eq!(settled.status, order_status::PAID);
    assert!(settled.paid_at.is_some());
    assert_eq!(settled.total_amount, 350);

    // Cart clearing is scoped to the order's owner.
    assert_eq!(cart_len(&state, &buyer).await?, 0);
    assert_eq!(cart_len(&state, &bystander).await?, 1);

    // Paid orders commit stock.
    let restocked = Products::find_by_id(product_a)
        .one(&state.orm)
        .await?
        .expect("product");
    assert_eq!(restocked.stock, 8);

    // Duplicate delivery is a no-op success.
    let ack = payment_service::resolve_callback(
        &state,
        success_callback(&order.reference, &push_id),
    )
    .await?;
    assert_eq!(ack.result_code, 0);

    let settled = Orders::find_by_id(order.id)
        .one(&state.orm)
        .await?
        .expect("order");
    assert_eq!(settled.status, order_status::PAID);
    assert_eq!(cart_len(&state, &bystander).await?, 1);

    Ok(())
}

#[tokio::test]
async fn cancelled_callback_fails_order_and_keeps_cart() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_token(&server).await;
    let push_id = format!("ws_CO_{}", Uuid::new_v4().simple());
    mount_push_accepted(&server, &push_id).await;

    let state = match try_setup_state(&server.uri()).await? {
        Some(state) => state,
        None => return Ok(()),
    };

    let buyer = create_user(&state, "user").await?;
    let address_id = create_address(&state, &buyer).await?;
    let product = create_product(&state, 700, 3).await?;
    add_cart_line(&state, &buyer, product, 1).await?;

    let resp = order_service::initiate_checkout(
        &state,
        &buyer,
        CheckoutRequest {
            address_id,
            phone: "254712345678".into(),
        },
    )
    .await?;
    let order = resp.data.expect("checkout data").order;

    // Cancellation callbacks carry no metadata; the order is matched through
    // the CheckoutRequestID recorded at push time.
    let ack =
        payment_service::resolve_callback(&state, failure_callback(&push_id, 1032))
            .await?;
    assert_eq!(ack.result_code, 0);

    let failed = Orders::find_by_id(order.id)
        .one(&state.orm)
        .await?
        .expect("order");
    assert_eq!(failed.status, order_status::FAILED);
    assert_eq!(cart_len(&state, &buyer).await?, 1);

    // A conflicting success afterwards never reverses a terminal state.
    let ack = payment_service::resolve_callback(
        &state,
        success_callback(&order.reference, &push_id),
    )
    .await?;
    assert_eq!(ack.result_code, 0);

    let still_failed = Orders::find_by_id(order.id)
        .one(&state.orm)
        .await?
        .expect("order");
    assert_eq!(still_failed.status, order_status::FAILED);
    assert_eq!(cart_len(&state, &buyer).await?, 1);

    Ok(())
}

#[tokio::test]
async fn callback_for_unknown_or_missing_reference_mutates_nothing() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let state = match try_setup_state(&server.uri()).await? {
        Some(state) => state,
        None => return Ok(()),
    };

    let err = payment_service::resolve_callback(
        &state,
        success_callback("ORD-does-not-exist", &format!("ws_CO_{}", Uuid::new_v4().simple())),
    )
    .await
    .expect_err("unknown reference must be rejected");
    assert!(matches!(err, AppError::UnknownOrder));

    // Neither AccountReference nor CheckoutRequestID: malformed.
    let envelope: StkCallbackEnvelope = serde_json::from_value(serde_json::json!({
        "Body": {
            "stkCallback": {
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully."
            }
        }
    }))?;
    let err = payment_service::resolve_callback(&state, envelope)
        .await
        .expect_err("callback without any reference must be rejected");
    assert!(matches!(err, AppError::MalformedCallback(_)));

    Ok(())
}

#[tokio::test]
async fn gateway_rejection_fails_order_and_keeps_cart() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/stkpush/v1/processrequest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ResponseCode": "1",
            "ResponseDescription": "Unable to process the request"
        })))
        .mount(&server)
        .await;

    let state = match try_setup_state(&server.uri()).await? {
        Some(state) => state,
        None => return Ok(()),
    };

    let buyer = create_user(&state, "user").await?;
    let address_id = create_address(&state, &buyer).await?;
    let product = create_product(&state, 300, 4).await?;
    add_cart_line(&state, &buyer, product, 2).await?;

    let err = order_service::initiate_checkout(
        &state,
        &buyer,
        CheckoutRequest {
            address_id,
            phone: "254712345678".into(),
        },
    )
    .await
    .expect_err("rejected push must surface");
    assert!(matches!(err, AppError::GatewayRejected(_)));

    // The order is retained for audit as failed; the cart survives for retry.
    let orders = order_service::list_orders(
        &state,
        &buyer,
        axum_storefront_api::routes::params::OrderListQuery {
            pagination: axum_storefront_api::routes::params::Pagination {
                page: None,
                per_page: None,
            },
            status: None,
            sort_order: None,
        },
    )
    .await?;
    let orders = orders.data.expect("order list").items;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, order_status::FAILED);
    assert_eq!(cart_len(&state, &buyer).await?, 1);

    Ok(())
}

#[tokio::test]
async fn unreachable_gateway_fails_order_and_keeps_cart() -> anyhow::Result<()> {
    // No token mock mounted: the token fetch gets a 404 from the mock server.
    let server = MockServer::start().await;
    let state = match try_setup_state(&server.uri()).await? {
        Some(state) => state,
        None => return Ok(()),
    };

    let buyer = create_user(&state, "user").await?;
    let address_id = create_address(&state, &buyer).await?;
    let product = create_product(&state, 300, 4).await?;
    add_cart_line(&state, &buyer, product, 1).await?;

    let err = order_service::initiate_checkout(
        &state,
        &buyer,
        CheckoutRequest {
            address_id,
            phone: "254712345678".into(),
        },
    )
    .await
    .expect_err("token failure must surface");
    assert!(matches!(err, AppError::GatewayUnavailable(_)));
    assert_eq!(cart_len(&state, &buyer).await?, 1);

    Ok(())
}

#[tokio::test]
async fn checkout_preconditions_are_enforced() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_token(&server).await;
    let push_id = format!("ws_CO_{}", Uuid::new_v4().simple());
    mount_push_accepted(&server, &push_id).await;

    let state = match try_setup_state(&server.uri()).await? {
        Some(state) => state,
        None => return Ok(()),
    };

    let buyer = create_user(&state, "user").await?;
    let other = create_user(&state, "user").await?;
    let product = create_product(&state, 100, 10).await?;
    add_cart_line(&state, &buyer, product, 1).await?;

    // No address at all.
    let err = order_service::initiate_checkout(
        &state,
        &buyer,
        CheckoutRequest {
            address_id: Uuid::new_v4(),
            phone: "254712345678".into(),
        },
    )
    .await
    .expect_err("missing address must abort checkout");
    assert!(matches!(err, AppError::MissingAddress));

    // Somebody else's address is just as invalid.
    let foreign_address = create_address(&state, &other).await?;
    let err = order_service::initiate_checkout(
        &state,
        &buyer,
        CheckoutRequest {
            address_id: foreign_address,
            phone: "254712345678".into(),
        },
    )
    .await
    .expect_err("foreign address must abort checkout");
    assert!(matches!(err, AppError::MissingAddress));

    // Empty cart.
    let address_id = create_address(&state, &other).await?;
    let err = order_service::initiate_checkout(
        &state,
        &other,
        CheckoutRequest {
            address_id,
            phone: "254712345678".into(),
        },
    )
    .await
    .expect_err("empty cart must abort checkout");
    assert!(matches!(err, AppError::EmptyCart));

    Ok(())
}
