use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        cart::{CartItemDto, CartList},
        orders::{CheckoutRequest, CheckoutResponse, OrderList, OrderWithItems},
        payments::{CallbackAck, CallbackMetadata, MetadataItem, StkCallback, StkCallbackBody, StkCallbackEnvelope},
        products::ProductList,
    },
    models::{CartItem, Order, OrderItem, Product, User},
    response::{ApiResponse, Meta},
    routes::{auth, cart, health, orders, params, payments, products as product_routes},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        auth::login,
        auth::register,
        cart::cart_list,
        cart::add_to_cart,
        cart::increment,
        cart::decrement,
        cart::remove_from_cart,
        product_routes::list_products,
        product_routes::create_product,
        product_routes::get_product,
        product_routes::update_product,
        product_routes::delete_product,
        orders::list_orders,
        orders::checkout,
        orders::get_order,
        payments::mpesa_callback
    ),
    components(
        schemas(
            User,
            Product,
            CartItem,
            Order,
            OrderItem,
            CartItemDto,
            CartList,
            CheckoutRequest,
            CheckoutResponse,
            OrderList,
            OrderWithItems,
            StkCallbackEnvelope,
            StkCallbackBody,
            StkCallback,
            CallbackMetadata,
            MetadataItem,
            CallbackAck,
            params::Pagination,
            params::ProductQuery,
            params::OrderListQuery,
            ProductList,
            Meta,
            ApiResponse<Product>,
            ApiResponse<ProductList>,
            ApiResponse<CheckoutResponse>,
            ApiResponse<OrderWithItems>,
            ApiResponse<OrderList>,
            ApiResponse<CartList>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Products", description = "Product endpoints"),
        (name = "Cart", description = "Cart endpoints"),
        (name = "Orders", description = "Order and checkout endpoints"),
        (name = "Payments", description = "Payment gateway callback"),
        (name = "Auth", description = "Authentication endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
