//! Diesel table definitions for the preview environment control plane.
//!
//! Tables: users, environments, deployments, webhook_deliveries.

diesel::table! {
    users (id) {
        id -> Int8,
        github_id -> Int8,
        github_login -> Varchar,
        email -> Nullable<Varchar>,
        avatar_url -> Nullable<Varchar>,
        is_active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    environments (id) {
        id -> Int8,
        repository_full_name -> Varchar,
        repository_name -> Varchar,
        pr_number -> Int4,
        pr_title -> Nullable<Varchar>,
        branch_name -> Varchar,
        commit_sha -> Varchar,
        namespace -> Varchar,
        environment_url -> Nullable<Varchar>,
        status -> Varchar,
        installation_id -> Nullable<Int8>,
        owner_id -> Int8,
        error_message -> Nullable<Text>,
        head_updated_at -> Nullable<Timestamptz>,
        last_deployed_at -> Nullable<Timestamptz>,
        destroyed_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    deployments (id) {
        id -> Int8,
        environment_id -> Int8,
        commit_sha -> Varchar,
        commit_message -> Nullable<Text>,
        status -> Varchar,
        started_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        error_message -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    webhook_deliveries (delivery_id) {
        delivery_id -> Varchar,
        event_type -> Varchar,
        received_at -> Timestamptz,
    }
}

diesel::joinable!(environments -> users (owner_id));
diesel::joinable!(deployments -> environments (environment_id));

diesel::allow_tables_to_appear_in_same_query!(users, environments, deployments, webhook_deliveries);
