// Mirrors src/db/schema.sql, keep the two in sync.

diesel::table! {
    agents (id) {
        id -> Int4,
        sn -> Text,
        key -> Text,
        enabled -> Bool,
        last_seen -> Nullable<Timestamp>,
        updated_at -> Timestamp,
        created_at -> Timestamp,
    }
}

diesel::table! {
    tasks (id) {
        id -> Int8,
        uuid -> Text,
        agent_id -> Int4,
        payload -> Text,
        status_code -> Int4,
        result -> Nullable<Text>,
        date_queued -> Timestamp,
        date_dispatched -> Nullable<Timestamp>,
        date_finished -> Nullable<Timestamp>,
    }
}

diesel::table! {
    logs (id) {
        id -> Int8,
        agent_id -> Int4,
        ip -> Text,
        task -> Text,
        message -> Text,
        created_at -> Timestamp,
    }
}

diesel::joinable!(tasks -> agents (agent_id));
diesel::joinable!(logs -> agents (agent_id));

diesel::allow_tables_to_appear_in_same_query!(
    agents,
    tasks,
    logs,
);
