//! Recipient selection for governance emails

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::GovernanceResult;

/// Emails of all members of an organisation, any role
pub(crate) async fn all_member_emails(
    pool: &PgPool,
    organisation_id: Uuid,
) -> GovernanceResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT u.email
        FROM users u
        JOIN user_organisations uo ON uo.user_id = u.id
        WHERE uo.organisation_id = $1
        ORDER BY u.email
        "#,
    )
    .bind(organisation_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(email,)| email).collect())
}

/// Emails of the organisation's admins only
pub(crate) async fn admin_emails(
    pool: &PgPool,
    organisation_id: Uuid,
) -> GovernanceResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT u.email
        FROM users u
        JOIN user_organisations uo ON uo.user_id = u.id
        WHERE uo.organisation_id = $1 AND uo.role = 'admin'
        ORDER BY u.email
        "#,
    )
    .bind(organisation_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(email,)| email).collect())
}
