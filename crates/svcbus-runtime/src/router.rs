//! Router service registry
//!
//! Tracks which connected peer provides each named service and which peers
//! consume it. Consumers hear `ServiceAvailable` when their provider shows up
//! and `ServiceUnavailable` when it unregisters or disconnects.

use std::collections::HashSet;
use std::net::SocketAddr;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use svcbus_core::message::{ControlMessage, ServiceNotice, ServiceRegistration};
use svcbus_core::{Cookie, RemoteMessage};

use crate::service::{Outbox, ServerListener};

#[derive(Debug, Default)]
pub struct RouterServiceRegistry {
    providers: DashMap<String, Cookie>,
    consumers: DashMap<String, HashSet<Cookie>>,
}

impl RouterServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self, service: &str) -> Option<Cookie> {
        self.providers.get(service).map(|entry| *entry.value())
    }

    pub fn consumers(&self, service: &str) -> Vec<Cookie> {
        let mut consumers: Vec<Cookie> = self
            .consumers
            .get(service)
            .map(|entry| entry.value().iter().copied().collect())
            .unwrap_or_default();
        consumers.sort();
        consumers
    }

    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        services.sort();
        services
    }

    fn notify(&self, outbox: &mut Outbox, target: Cookie, notice: ControlMessage) {
        match notice.into_message(target, Cookie::ROUTER) {
            Ok(message) => outbox.send(message),
            Err(e) => warn!(%target, error = %e, "Failed to encode service notice"),
        }
    }

    fn notify_consumers(&self, outbox: &mut Outbox, service: &str, provider: Cookie, available: bool) {
        for consumer in self.consumers(service) {
            if consumer == provider {
                continue;
            }
            let notice = ServiceNotice {
                service: service.to_string(),
                provider,
            };
            let notice = if available {
                ControlMessage::ServiceAvailable(notice)
            } else {
                ControlMessage::ServiceUnavailable(notice)
            };
            self.notify(outbox, consumer, notice);
        }
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    fn register_provider(&self, registration: ServiceRegistration, peer: Cookie, outbox: &mut Outbox) {
        let service = registration.service;
        if let Some(previous) = self.providers.insert(service.clone(), peer) {
            if previous != peer {
                warn!(%service, %previous, provider = %peer, "Service provider replaced");
            }
        }
        info!(%service, provider = %peer, "Service provider registered");
        self.notify_consumers(outbox, &service, peer, true);
    }

    fn unregister_provider(&self, registration: ServiceRegistration, peer: Cookie, outbox: &mut Outbox) {
        let service = registration.service;
        if self
            .providers
            .remove_if(&service, |_, provider| *provider == peer)
            .is_some()
        {
            info!(%service, provider = %peer, "Service provider unregistered");
            self.notify_consumers(outbox, &service, peer, false);
        }
    }

    fn register_consumer(&self, registration: ServiceRegistration, peer: Cookie, outbox: &mut Outbox) {
        let service = registration.service;
        self.consumers.entry(service.clone()).or_default().insert(peer);
        debug!(%service, consumer = %peer, "Service consumer registered");

        if let Some(provider) = self.provider(&service) {
            self.notify(
                outbox,
                peer,
                ControlMessage::ServiceAvailable(ServiceNotice { service, provider }),
            );
        }
    }

    fn unregister_consumer(&self, registration: ServiceRegistration, peer: Cookie) {
        if let Some(mut consumers) = self.consumers.get_mut(&registration.service) {
            consumers.remove(&peer);
        }
        self.consumers.retain(|_, consumers| !consumers.is_empty());
    }
}

impl ServerListener for RouterServiceRegistry {
    fn server_started(&self, address: &SocketAddr) {
        info!(%address, "Router accepting peers");
    }

    fn server_stopped(&self) {
        self.providers.clear();
        self.consumers.clear();
        info!("Router stopped, registry cleared");
    }

    fn peer_disconnected(&self, cookie: Cookie, outbox: &mut Outbox) {
        let provided: Vec<String> = self
            .providers
            .iter()
            .filter(|entry| *entry.value() == cookie)
            .map(|entry| entry.key().clone())
            .collect();

        for service in provided {
            if self.providers.remove_if(&service, |_, p| *p == cookie).is_some() {
                self.notify_consumers(outbox, &service, cookie, false);
            }
        }

        for mut entry in self.consumers.iter_mut() {
            entry.value_mut().remove(&cookie);
        }
        self.consumers.retain(|_, consumers| !consumers.is_empty());
    }

    fn message_received(&self, message: &RemoteMessage, outbox: &mut Outbox) -> bool {
        let peer = message.source_cookie();
        let control = match ControlMessage::decode(message) {
            Ok(Some(control)) => control,
            Ok(None) => return false,
            Err(e) => {
                warn!(%peer, error = %e, "Undecodable control message");
                return false;
            }
        };

        match control {
            ControlMessage::RegisterProvider(r) => self.register_provider(r, peer, outbox),
            ControlMessage::UnregisterProvider(r) => self.unregister_provider(r, peer, outbox),
            ControlMessage::RegisterConsumer(r) => self.register_consumer(r, peer, outbox),
            ControlMessage::UnregisterConsumer(r) => self.unregister_consumer(r, peer),
            other => {
                debug!(%peer, id = ?other.id(), "Control message not handled by the registry");
                return false;
            }
        }
        true
    }
}
