use std::sync::Arc;

use application::{AckProcessor, Clock, HubHandle};
use config::SessionConfig;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub acks: Arc<AckProcessor>,
    pub jwt_service: Arc<JwtService>,
    pub session: SessionConfig,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(
        hub: HubHandle,
        acks: Arc<AckProcessor>,
        jwt_service: Arc<JwtService>,
        session: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            hub,
            acks,
            jwt_service,
            session,
            clock,
        }
    }
}
