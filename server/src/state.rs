use std::sync::Arc;

use crate::checkout::CheckoutService;
use crate::payment::PaymentGateway;
use crate::store::Store;

/// Shared handles every request handler receives.
pub struct AppState<S> {
    pub checkout: CheckoutService<S>,
    pub store: S,
    pub payments: Arc<dyn PaymentGateway>,
}

impl<S: Store> AppState<S> {
    pub fn new(store: S, payments: Arc<dyn PaymentGateway>) -> Self {
        Self {
            checkout: CheckoutService::new(store.clone()),
            store,
            payments,
        }
    }
}

impl<S: Clone> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            checkout: self.checkout.clone(),
            store: self.store.clone(),
            payments: Arc::clone(&self.payments),
        }
    }
}
