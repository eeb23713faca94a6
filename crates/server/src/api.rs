//! JSON API over the expense workflow.
//!
//! Every request names its caller in `x-actor-id`; `x-correlation-id` is echoed into
//! error bodies and logs, and generated when absent.
//!
//! - `POST   /expenses`                        submit an expense
//! - `PATCH  /expenses/{id}`                   edit description, date or receipt
//! - `DELETE /expenses/{id}`                   delete an expense
//! - `POST   /expenses/{id}/decision`          approve or reject as the current approver
//! - `POST   /expenses/{id}/override`          admin status override
//! - `POST   /expenses/{id}/assign`            admin approver assignment
//! - `GET    /approvers/{id}/pending`          expenses awaiting one approver
//! - `GET    /employees/{id}/expenses`         an employee's own expenses
//! - `GET    /managers/{id}/team-expenses`     expenses of a manager's direct reports
//! - `GET    /companies/{id}/expenses`         all company expenses
//! - `GET    /companies/{id}/unrouted`         awaiting a decision with no approver
//! - `GET    /companies/{id}/summary`          ledger totals by status and category
//! - `GET    /companies/{id}/rules`            approval rules in match order
//! - `POST   /companies/{id}/rules`            create a rule
//! - `PUT    /rules/{id}`                      replace a rule definition
//! - `DELETE /rules/{id}`                      delete a rule
//! - `PATCH  /companies/{id}`                  admin edit of name, currency or country
//! - `GET    /companies/{id}/users`            company directory
//! - `POST   /companies/{id}/users`            create a user
//! - `PUT    /users/{id}`                      replace a user's profile, role and manager
//! - `DELETE /users/{id}`                      delete a user with no expense history

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::NaiveDate;
use reimburse_core::{
    ApplicationError, ApprovalRule, Company, CompanyId, CompanySettings, DecisionAction, Expense,
    ExpenseCategory, ExpenseId, ExpensePatch, ExpenseStatus, ExpenseWorkflow, InterfaceError,
    LedgerSummary, NewExpense, RequestContext, RoutingState, RuleDraft, RuleId, User, UserDraft,
    UserId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub const ACTOR_HEADER: &str = "x-actor-id";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    workflow: ExpenseWorkflow,
}

pub fn router(workflow: ExpenseWorkflow) -> Router {
    Router::new()
        .route("/expenses", post(submit_expense))
        .route("/expenses/{id}", axum::routing::patch(patch_expense).delete(delete_expense))
        .route("/expenses/{id}/decision", post(decide))
        .route("/expenses/{id}/override", post(override_status))
        .route("/expenses/{id}/assign", post(assign_approver))
        .route("/approvers/{id}/pending", get(pending_for_approver))
        .route("/employees/{id}/expenses", get(expenses_for_employee))
        .route("/managers/{id}/team-expenses", get(team_expenses))
        .route("/companies/{id}/expenses", get(expenses_for_company))
        .route("/companies/{id}/unrouted", get(unrouted_expenses))
        .route("/companies/{id}/summary", get(company_summary))
        .route("/companies/{id}/rules", get(list_rules).post(create_rule))
        .route("/rules/{id}", put(update_rule).delete(delete_rule))
        .route("/companies/{id}", axum::routing::patch(update_company))
        .route("/companies/{id}/users", get(list_users).post(create_user))
        .route("/users/{id}", put(update_user).delete(delete_user))
        .with_state(ApiState { workflow })
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitExpenseBody {
    /// Defaults to the calling actor.
    #[serde(default)]
    pub employee_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub category: ExpenseCategory,
    pub description: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub receipt_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DecisionBody {
    pub action: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OverrideBody {
    pub status: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssignBody {
    pub approver_id: String,
}

#[derive(Debug, Serialize)]
pub struct ExpenseView {
    #[serde(flatten)]
    pub expense: Expense,
    pub routing_state: RoutingState,
}

impl From<Expense> for ExpenseView {
    fn from(expense: Expense) -> Self {
        let routing_state = expense.routing_state();
        Self { expense, routing_state }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: &'static str,
    pub detail: String,
    pub correlation_id: String,
}

/// Wraps [`InterfaceError`] so it can be rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

impl ApiError {
    fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self(InterfaceError::BadRequest {
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        })
    }

    fn from_application(error: ApplicationError, correlation_id: &str) -> Self {
        let mapped = error.into_interface(correlation_id);
        warn!(
            event_name = "api.request.failed",
            correlation_id = %correlation_id,
            error = %mapped,
            "request failed"
        );
        Self(mapped)
    }

    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            InterfaceError::BadRequest { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
            InterfaceError::Forbidden { .. } => (StatusCode::FORBIDDEN, "forbidden"),
            InterfaceError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            InterfaceError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
            InterfaceError::ServiceUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.status_and_kind();
        let body = ErrorBody {
            error,
            message: self.0.user_message(),
            detail: self.0.to_string(),
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Header and body helpers
// ---------------------------------------------------------------------------

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn request_context(headers: &HeaderMap) -> ApiResult<RequestContext> {
    let correlation_id = correlation_id(headers);
    let actor = headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match actor {
        Some(actor) => Ok(RequestContext::new(UserId(actor.to_string()), correlation_id)),
        None => Err(ApiError::bad_request(
            format!("missing `{ACTOR_HEADER}` header"),
            &correlation_id,
        )),
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>, correlation_id: &str) -> ApiResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text(), correlation_id))
}

fn views(expenses: Vec<Expense>) -> Json<Vec<ExpenseView>> {
    Json(expenses.into_iter().map(ExpenseView::from).collect())
}

// ---------------------------------------------------------------------------
// Expense commands
// ---------------------------------------------------------------------------

async fn submit_expense(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<SubmitExpenseBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ExpenseView>)> {
    let ctx = request_context(&headers)?;
    let body = json_body(payload, &ctx.correlation_id)?;

    let submission = NewExpense {
        employee_id: body.employee_id.map(UserId).unwrap_or_else(|| ctx.actor_id.clone()),
        amount: body.amount,
        currency: body.currency,
        category: body.category,
        description: body.description,
        date: body.date,
        receipt_url: body.receipt_url,
    };

    let expense = state
        .workflow
        .submit_expense(&ctx, submission)
        .await
        .map_err(|error| ApiError::from_application(error, &ctx.correlation_id))?;
    Ok((StatusCode::CREATED, Json(expense.into())))
}

async fn patch_expense(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<ExpensePatch>, JsonRejection>,
) -> ApiResult<Json<ExpenseView>> {
    let ctx = request_context(&headers)?;
    let patch = json_body(payload, &ctx.correlation_id)?;

    let expense = state
        .workflow
        .patch_expense(&ctx, &ExpenseId(id), patch)
        .await
        .map_err(|error| ApiError::from_application(error, &ctx.correlation_id))?;
    Ok(Json(expense.into()))
}

async fn delete_expense(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let ctx = request_context(&headers)?;

    state
        .workflow
        .delete_expense(&ctx, &ExpenseId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &ctx.correlation_id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn decide(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<DecisionBody>, JsonRejection>,
) -> ApiResult<Json<ExpenseView>> {
    let ctx = request_context(&headers)?;
    let body = json_body(payload, &ctx.correlation_id)?;
    let action = DecisionAction::parse(&body.action).ok_or_else(|| {
        ApiError::bad_request(
            format!("unknown decision `{}`; expected approved or rejected", body.action),
            &ctx.correlation_id,
        )
    })?;

    let expense = state
        .workflow
        .decide(&ctx, &ExpenseId(id), action, body.comment)
        .await
        .map_err(|error| ApiError::from_application(error, &ctx.correlation_id))?;
    Ok(Json(expense.into()))
}

async fn override_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<OverrideBody>, JsonRejection>,
) -> ApiResult<Json<ExpenseView>> {
    let ctx = request_context(&headers)?;
    let body = json_body(payload, &ctx.correlation_id)?;
    let status = ExpenseStatus::parse(&body.status).ok_or_else(|| {
        ApiError::bad_request(format!("unknown status `{}`", body.status), &ctx.correlation_id)
    })?;

    let expense = state
        .workflow
        .override_status(&ctx, &ExpenseId(id), status, body.comment)
        .await
        .map_err(|error| ApiError::from_application(error, &ctx.correlation_id))?;
    Ok(Json(expense.into()))
}

async fn assign_approver(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<AssignBody>, JsonRejection>,
) -> ApiResult<Json<ExpenseView>> {
    let ctx = request_context(&headers)?;
    let body = json_body(payload, &ctx.correlation_id)?;

    let expense = state
        .workflow
        .assign_approver(&ctx, &ExpenseId(id), &UserId(body.approver_id))
        .await
        .map_err(|error| ApiError::from_application(error, &ctx.correlation_id))?;
    Ok(Json(expense.into()))
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

async fn pending_for_approver(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ExpenseView>>> {
    let cid = correlation_id(&headers);
    let expenses = state
        .workflow
        .pending_for_approver(&UserId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    Ok(views(expenses))
}

async fn expenses_for_employee(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ExpenseView>>> {
    let cid = correlation_id(&headers);
    let expenses = state
        .workflow
        .expenses_for_employee(&UserId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    Ok(views(expenses))
}

async fn team_expenses(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ExpenseView>>> {
    let cid = correlation_id(&headers);
    let expenses = state
        .workflow
        .team_expenses(&UserId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    Ok(views(expenses))
}

async fn expenses_for_company(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ExpenseView>>> {
    let cid = correlation_id(&headers);
    let expenses = state
        .workflow
        .expenses_for_company(&CompanyId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    Ok(views(expenses))
}

async fn unrouted_expenses(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ExpenseView>>> {
    let cid = correlation_id(&headers);
    let expenses = state
        .workflow
        .unrouted_expenses(&CompanyId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    Ok(views(expenses))
}

async fn company_summary(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<LedgerSummary>> {
    let cid = correlation_id(&headers);
    let summary = state
        .workflow
        .company_summary(&CompanyId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    Ok(Json(summary))
}

// ---------------------------------------------------------------------------
// Approval rules
// ---------------------------------------------------------------------------

async fn list_rules(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ApprovalRule>>> {
    let cid = correlation_id(&headers);
    let rules = state
        .workflow
        .list_rules(&CompanyId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    Ok(Json(rules))
}

async fn create_rule(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<RuleDraft>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApprovalRule>)> {
    let ctx = request_context(&headers)?;
    let draft = json_body(payload, &ctx.correlation_id)?;

    let rule = state
        .workflow
        .create_rule(&ctx, &CompanyId(id), draft)
        .await
        .map_err(|error| ApiError::from_application(error, &ctx.correlation_id))?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<RuleDraft>, JsonRejection>,
) -> ApiResult<Json<ApprovalRule>> {
    let ctx = request_context(&headers)?;
    let draft = json_body(payload, &ctx.correlation_id)?;

    let rule = state
        .workflow
        .update_rule(&ctx, &RuleId(id), draft)
        .await
        .map_err(|error| ApiError::from_application(error, &ctx.correlation_id))?;
    Ok(Json(rule))
}

async fn delete_rule(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let ctx = request_context(&headers)?;

    state
        .workflow
        .delete_rule(&ctx, &RuleId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &ctx.correlation_id))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Company directory
// ---------------------------------------------------------------------------

async fn update_company(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<CompanySettings>, JsonRejection>,
) -> ApiResult<Json<Company>> {
    let ctx = request_context(&headers)?;
    let settings = json_body(payload, &ctx.correlation_id)?;

    let company = state
        .workflow
        .update_company(&ctx, &CompanyId(id), settings)
        .await
        .map_err(|error| ApiError::from_application(error, &ctx.correlation_id))?;
    Ok(Json(company))
}

async fn list_users(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<User>>> {
    let cid = correlation_id(&headers);
    let users = state
        .workflow
        .list_users(&CompanyId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    Ok(Json(users))
}

async fn create_user(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<UserDraft>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let ctx = request_context(&headers)?;
    let draft = json_body(payload, &ctx.correlation_id)?;

    let user = state
        .workflow
        .create_user(&ctx, &CompanyId(id), draft)
        .await
        .map_err(|error| ApiError::from_application(error, &ctx.correlation_id))?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn update_user(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<UserDraft>, JsonRejection>,
) -> ApiResult<Json<User>> {
    let ctx = request_context(&headers)?;
    let draft = json_body(payload, &ctx.correlation_id)?;

    let user = state
        .workflow
        .update_user(&ctx, &UserId(id), draft)
        .await
        .map_err(|error| ApiError::from_application(error, &ctx.correlation_id))?;
    Ok(Json(user))
}

async fn delete_user(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let ctx = request_context(&headers)?;

    state
        .workflow
        .delete_user(&ctx, &UserId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &ctx.correlation_id))?;
    Ok(StatusCode::NO_CONTENT)
}
