//! Paid enrollment. The student is sent to the gateway's payment page; the
//! pending order lives in their [`Session`] until the gateway calls back or
//! the student polls for the result.

use std::future::Future;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use time::Duration;
use tracing::{error, info, warn};

use super::{EnrollOutcome, enroll_free, enroll_in, find_enrollment};
use crate::catalog::course::get_course;
use crate::config::PaymentConfig;
use crate::error::{Error, Result};
use crate::progress::ProgressEngine;
use crate::session::Session;
use crate::utils::now;

pub const PENDING_PAYMENT_KEY: &str = "pending_payment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Success,
    Pending,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayTransaction {
    pub transaction_id: String,
    /// Page the student pays on
    pub payment_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub order_id: String,
    pub status: PaymentStatus,
}

/// Payment provider client.
pub trait PaymentGateway: Send + Sync {
    fn create_transaction(
        &self,
        amount: i64,
        order_id: &str,
        description: &str,
        redirect_url: &str,
    ) -> impl Future<Output = anyhow::Result<GatewayTransaction>> + Send;

    fn verify_transaction(&self, transaction_id: &str) -> impl Future<Output = anyhow::Result<PaymentStatus>> + Send;

    /// Decode the signed token the gateway appends to the redirect url.
    fn decode_callback(&self, token: &str) -> anyhow::Result<CallbackPayload>;
}

/// The order waiting for the gateway, as stored in the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPayment {
    pub student_id: i64,
    pub course_id: i64,
    pub order_id: String,
    pub transaction_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum PaymentStart {
    /// Send the student to `payment_url`
    Redirect { order_id: String, payment_url: String },
    /// Nothing to pay: the course is free or the student is already enrolled
    Enrolled(EnrollOutcome),
}

#[derive(Debug, Clone, Serialize)]
pub enum PaymentOutcome {
    Enrolled(EnrollOutcome),
    /// The gateway has not settled yet; the session entry is kept for polling
    Pending { order_id: String },
}

fn order_id(course_id: i64, student_id: i64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!(
        "course_{course_id}_{student_id}_{}_{suffix}",
        now().unix_timestamp()
    )
}

pub struct PaymentEnrollment<G> {
    progress: ProgressEngine,
    gateway: G,
    config: PaymentConfig,
}

impl<G: PaymentGateway> PaymentEnrollment<G> {
    pub fn new(progress: ProgressEngine, gateway: G, config: PaymentConfig) -> Self {
        Self {
            progress,
            gateway,
            config,
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Open a gateway transaction for a paid course and remember it in the session.
    pub async fn start_payment_enrollment(
        &self,
        session: &mut Session,
        student_id: i64,
        course_id: i64,
    ) -> Result<PaymentStart> {
        let course = {
            let mut conn = self.progress.database().acquire().await?;
            if let Some(existing) = find_enrollment(&mut conn, student_id, course_id).await? {
                return Ok(PaymentStart::Enrolled(EnrollOutcome::AlreadyEnrolled(existing)));
            }
            get_course(&mut conn, course_id).await?
        };
        if course.is_free() {
            let outcome = enroll_free(&self.progress, student_id, course_id).await?;
            return Ok(PaymentStart::Enrolled(outcome));
        }

        let order_id = order_id(course_id, student_id);
        let description = format!("Enrollment in {}", course.title);
        let transaction = self
            .gateway
            .create_transaction(course.price, &order_id, &description, &self.config.redirect_url)
            .await
            .map_err(|e| {
                error!("gateway rejected order {}: {}", order_id, e);
                Error::PaymentFailed(e.to_string())
            })?;
        let pending = PendingPayment {
            student_id,
            course_id,
            order_id: order_id.clone(),
            transaction_id: transaction.transaction_id,
        };
        session
            .insert(
                PENDING_PAYMENT_KEY,
                &pending,
                Duration::minutes(self.config.session_ttl_minutes),
            )
            .map_err(|e| Error::Fatal(e.into()))?;
        info!(
            "order {} opened for student {} in course {}-{}",
            order_id, student_id, course.id, course.title
        );
        Ok(PaymentStart::Redirect {
            order_id,
            payment_url: transaction.payment_url,
        })
    }

    /// Handle the gateway redirect carrying `token`.
    pub async fn confirm_payment(&self, session: &mut Session, token: &str) -> Result<PaymentOutcome> {
        let pending = session
            .get::<PendingPayment>(PENDING_PAYMENT_KEY)
            .ok_or(Error::PaymentSessionMissing)?;
        let payload = self.gateway.decode_callback(token).map_err(|e| {
            warn!("undecodable payment callback: {}", e);
            session.remove(PENDING_PAYMENT_KEY);
            Error::PaymentFailed(e.to_string())
        })?;
        if payload.order_id != pending.order_id {
            warn!(
                "callback order {} does not match pending order {}",
                payload.order_id, pending.order_id
            );
            session.remove(PENDING_PAYMENT_KEY);
            return Err(Error::PaymentMismatch {
                expected: pending.order_id,
                received: payload.order_id,
            });
        }
        self.settle(session, pending, payload.status).await
    }

    /// Ask the gateway about the pending order without waiting for the callback.
    pub async fn poll_payment(&self, session: &mut Session) -> Result<PaymentOutcome> {
        let pending = session
            .get::<PendingPayment>(PENDING_PAYMENT_KEY)
            .ok_or(Error::PaymentSessionMissing)?;
        let status = self
            .gateway
            .verify_transaction(&pending.transaction_id)
            .await
            .map_err(|e| {
                error!("verifying transaction {} failed: {}", pending.transaction_id, e);
                Error::PaymentFailed(e.to_string())
            })?;
        self.settle(session, pending, status).await
    }

    async fn settle(
        &self,
        session: &mut Session,
        pending: PendingPayment,
        status: PaymentStatus,
    ) -> Result<PaymentOutcome> {
        match status {
            PaymentStatus::Pending => {
                info!("order {} still pending", pending.order_id);
                Ok(PaymentOutcome::Pending {
                    order_id: pending.order_id,
                })
            }
            PaymentStatus::Failed => {
                warn!("order {} failed", pending.order_id);
                session.remove(PENDING_PAYMENT_KEY);
                Err(Error::PaymentFailed(format!(
                    "order {} was declined",
                    pending.order_id
                )))
            }
            PaymentStatus::Success => {
                let mut tx = self.progress.database().begin().await?;
                let outcome = enroll_in(&mut tx, pending.student_id, pending.course_id).await?;
                tx.commit().await?;
                session.remove(PENDING_PAYMENT_KEY);
                info!(
                    "order {} paid, student {} enrolled as enrollment {}",
                    pending.order_id,
                    pending.student_id,
                    outcome.enrollment().id
                );
                Ok(PaymentOutcome::Enrolled(outcome))
            }
        }
    }
}
