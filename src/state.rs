use crate::{
    db::{DbPool, OrmConn},
    mpesa::MpesaClient,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub orm: OrmConn,
    pub mpesa: MpesaClient,
    pub shipping_cost: i64,
}
