diesel::table! {
    use diesel::sql_types::*;

    domain_events (id) {
        id -> Uuid,
        aggregate_id -> Varchar,
        aggregate_type -> Varchar,
        sequence_number -> Int8,
        event_type -> Varchar,
        payload -> Json,
        metadata -> Json,
        recorded_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    aggregate_snapshots (id) {
        id -> Uuid,
        aggregate_id -> Varchar,
        aggregate_type -> Varchar,
        sequence_number -> Int8,
        payload -> Json,
        recorded_at -> Timestamptz,
    }
}
