//! Order requests, their validation, and the event built from them.

use crate::error::ValidationError;
use crate::schema::SchemaBinding;
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Event type name used for registry subjects and record headers.
pub const ORDER_CREATED: &str = "OrderCreated";

/// An inbound order, as received from the ingestion layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub order_id: String,
    pub symbol: String,
    pub qty: i64,
    pub price: f64,
}

/// An [`OrderRequest`] that passed [`validate`].
///
/// Only obtainable through validation, so holding one proves the invariants
/// (non-blank ids, positive quantity, finite non-negative price) hold.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedOrder(OrderRequest);

impl ValidatedOrder {
    pub fn into_inner(self) -> OrderRequest {
        self.0
    }
}

impl Deref for ValidatedOrder {
    type Target = OrderRequest;

    fn deref(&self) -> &OrderRequest {
        &self.0
    }
}

/// Checks an order request for structural and semantic validity.
///
/// Pure: no I/O and no side effects. The request is returned unchanged when
/// it is valid.
pub fn validate(request: OrderRequest) -> Result<ValidatedOrder, ValidationError> {
    if request.order_id.trim().is_empty() {
        return Err(ValidationError::EmptyOrderId);
    }
    if request.symbol.trim().is_empty() {
        return Err(ValidationError::EmptySymbol);
    }
    if request.qty <= 0 {
        return Err(ValidationError::NonPositiveQty(request.qty));
    }
    if !request.price.is_finite() || request.price < 0.0 {
        return Err(ValidationError::InvalidPrice(request.price));
    }
    Ok(ValidatedOrder(request))
}

/// The event published for every accepted order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderCreatedEvent {
    pub order_id: String,
    pub symbol: String,
    pub qty: i64,
    pub price: f64,
    pub schema_id: u32,
}

impl OrderCreatedEvent {
    pub fn new(order: ValidatedOrder, binding: &SchemaBinding) -> Self {
        let OrderRequest {
            order_id,
            symbol,
            qty,
            price,
        } = order.into_inner();

        Self {
            order_id,
            symbol,
            qty,
            price,
            schema_id: binding.schema_id,
        }
    }
}
