//! GitHub user records.

use diesel::prelude::*;
use diesel::dsl::sql;
use diesel::sql_types::{Nullable, Varchar};
use diesel::upsert::excluded;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::models::user::{NewUser, User};
use crate::schema::users;

/// Insert the user on first sight, otherwise refresh login, email and avatar.
///
/// Email and avatar are only overwritten when the webhook carried a value.
pub async fn get_or_create_user(
    conn: &mut AsyncPgConnection,
    new_user: NewUser,
) -> anyhow::Result<User> {
    let user = diesel::insert_into(users::table)
        .values(&new_user)
        .on_conflict(users::github_id)
        .do_update()
        .set((
            users::github_login.eq(excluded(users::github_login)),
            users::email.eq(sql::<Nullable<Varchar>>(
                "COALESCE(EXCLUDED.email, users.email)",
            )),
            users::avatar_url.eq(sql::<Nullable<Varchar>>(
                "COALESCE(EXCLUDED.avatar_url, users.avatar_url)",
            )),
            users::updated_at.eq(diesel::dsl::now),
        ))
        .get_result::<User>(conn)
        .await?;

    tracing::debug!(user_id = user.id, login = %user.github_login, "Upserted user");
    Ok(user)
}
