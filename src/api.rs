use crate::{
    device_client::DeviceClient,
    http_client::{ServiceResultResponse, handle_service_result},
    services::{
        provisioning::{ProvisioningService, RunStarted, SubmitConfigRequest},
        validation::{ValidationService, catalog::TestCatalog},
    },
};
use actix_web::{HttpResponse, Responder, web};
use log::{debug, error};
use serde_valid::Validate;
use std::{sync::Arc, time::Duration};

pub struct Api<ServiceClient>
where
    ServiceClient: DeviceClient,
{
    pub service_client: Arc<ServiceClient>,
    pub validation: ValidationService<ServiceClient>,
}

impl<ServiceClient> Clone for Api<ServiceClient>
where
    ServiceClient: DeviceClient,
{
    fn clone(&self) -> Self {
        Self {
            service_client: self.service_client.clone(),
            validation: self.validation.clone(),
        }
    }
}

impl<ServiceClient> Api<ServiceClient>
where
    ServiceClient: DeviceClient + Send + Sync + 'static,
{
    pub fn new(
        service_client: ServiceClient,
        catalog: TestCatalog,
        poll_interval: Duration,
    ) -> Self {
        let service_client = Arc::new(service_client);
        let validation = ValidationService::new(service_client.clone(), catalog, poll_interval);

        Api {
            service_client,
            validation,
        }
    }

    pub async fn submit_config(
        body: web::Json<SubmitConfigRequest>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("submit_config() called");

        if let Err(e) = body.validate() {
            error!("submit_config rejected: {e}");
            return HttpResponse::BadRequest().body(e.to_string());
        }

        handle_service_result(
            ProvisioningService::submit(&*api.service_client, &api.validation, &body).await,
            "submit_config",
        )
    }

    pub async fn current_config(api: web::Data<Self>) -> impl Responder {
        debug!("current_config() called");
        handle_service_result(api.service_client.current_config().await, "current_config")
    }

    pub async fn validation_status(api: web::Data<Self>) -> impl Responder {
        debug!("validation_status() called");
        HttpResponse::Ok().json(api.validation.snapshot())
    }

    pub async fn restart_validation(api: web::Data<Self>) -> impl Responder {
        debug!("restart_validation() called");

        match api.validation.restart().await {
            Some((run_id, mode)) => RunStarted { run_id, mode }.into_response(),
            None => HttpResponse::Conflict().body("no configuration submitted yet"),
        }
    }

    pub async fn wifi_scan(api: web::Data<Self>) -> impl Responder {
        debug!("wifi_scan() called");
        handle_service_result(api.service_client.wifi_scan().await, "wifi_scan")
    }

    pub async fn reboot(api: web::Data<Self>) -> impl Responder {
        debug!("reboot() called");
        handle_service_result(api.service_client.reboot().await, "reboot")
    }

    pub async fn version() -> impl Responder {
        debug!("version() called");
        HttpResponse::Ok().body(env!("CARGO_PKG_VERSION"))
    }
}
