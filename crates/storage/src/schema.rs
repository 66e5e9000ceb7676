//! Schema definition, applied idempotently at startup.
//!
//! Ownership cascades live here (ON DELETE CASCADE), not in application
//! code. Timestamps are integer milliseconds since the epoch; UUID keys are
//! hyphenated TEXT; ciphertext columns are BLOBs — base64 exists only at
//! the wire.

use sqlx::SqlitePool;

use crate::Result;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        email         TEXT    NOT NULL UNIQUE,
        username      TEXT    NOT NULL UNIQUE,
        password_hash TEXT    NOT NULL,
        is_verified   INTEGER NOT NULL DEFAULT 0,
        lock_pin_hash TEXT,
        is_online     INTEGER NOT NULL DEFAULT 0,
        last_seen     INTEGER,
        is_deleted    INTEGER NOT NULL DEFAULT 0,
        created_at    INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS email_verifications (
        email      TEXT    PRIMARY KEY,
        code       TEXT    NOT NULL,
        expires_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS auth_tokens (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        token_hash TEXT    NOT NULL UNIQUE,
        kind       TEXT    NOT NULL,
        expires_at INTEGER NOT NULL,
        revoked    INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS conversations (
        id                   TEXT    PRIMARY KEY,
        conv_type            TEXT    NOT NULL DEFAULT 'private',
        only_admins_can_send INTEGER NOT NULL DEFAULT 0,
        last_message_id      TEXT,
        created_at           INTEGER NOT NULL,
        updated_at           INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS conversation_participants (
        conversation_id TEXT    NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        user_id         INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        role            TEXT    NOT NULL DEFAULT 'member',
        unread_count    INTEGER NOT NULL DEFAULT 0,
        muted_until     INTEGER,
        cleared_at      INTEGER,
        is_hidden       INTEGER NOT NULL DEFAULT 0,
        is_locked       INTEGER NOT NULL DEFAULT 0,
        is_favorite     INTEGER NOT NULL DEFAULT 0,
        is_blocked      INTEGER NOT NULL DEFAULT 0,
        last_read_at    INTEGER,
        PRIMARY KEY (conversation_id, user_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS messages (
        id                 TEXT    PRIMARY KEY,
        conversation_id    TEXT    NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        sender_id          INTEGER NOT NULL REFERENCES users(id),
        message_type       TEXT    NOT NULL DEFAULT 'text',
        content            BLOB    NOT NULL,
        created_at         INTEGER NOT NULL,
        is_deleted         INTEGER NOT NULL DEFAULT 0,
        is_edited          INTEGER NOT NULL DEFAULT 0,
        edited_at          INTEGER,
        reply_to_id        TEXT,
        forwarded_from_id  TEXT,
        attachment_id      TEXT,
        encrypted_file_key TEXT
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_messages_conv_created
        ON messages(conversation_id, created_at DESC)"#,
    r#"CREATE TABLE IF NOT EXISTS message_recipients (
        message_id TEXT    NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        content    BLOB    NOT NULL,
        PRIMARY KEY (message_id, user_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS message_status (
        message_id TEXT    NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        status     TEXT    NOT NULL DEFAULT 'sent',
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (message_id, user_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS message_reactions (
        message_id TEXT    NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        emoji      TEXT    NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (message_id, user_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS attachments (
        id                 TEXT    PRIMARY KEY,
        conversation_id    TEXT    NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        uploaded_by        INTEGER NOT NULL REFERENCES users(id),
        message_id         TEXT,
        file_path          TEXT    NOT NULL,
        thumbnail_path     TEXT,
        file_hash          TEXT    NOT NULL,
        encrypted_file_key TEXT    NOT NULL,
        encrypted_metadata TEXT    NOT NULL,
        file_size          INTEGER NOT NULL,
        created_at         INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS key_bundles (
        user_id                 INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
        crypto_version          INTEGER NOT NULL,
        identity_key            BLOB    NOT NULL,
        identity_dh_key         BLOB    NOT NULL,
        signed_prekey           BLOB    NOT NULL,
        signed_prekey_signature BLOB    NOT NULL,
        signed_prekey_id        INTEGER NOT NULL,
        signed_prekey_timestamp INTEGER NOT NULL,
        updated_at              INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS one_time_prekeys (
        user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        key_id     INTEGER NOT NULL,
        public_key BLOB    NOT NULL,
        is_used    INTEGER NOT NULL DEFAULT 0,
        used_by    INTEGER,
        used_at    INTEGER,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (user_id, key_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS ratchet_sessions (
        owner_id   INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        peer_id    INTEGER NOT NULL,
        state      BLOB    NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (owner_id, peer_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS key_fetch_log (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        requester_id INTEGER NOT NULL,
        target_id    INTEGER NOT NULL,
        ip           TEXT    NOT NULL DEFAULT '',
        user_agent   TEXT    NOT NULL DEFAULT '',
        created_at   INTEGER NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_key_fetch_requester
        ON key_fetch_log(requester_id, created_at)"#,
    r#"CREATE TABLE IF NOT EXISTS rate_events (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id    INTEGER NOT NULL,
        scope      TEXT    NOT NULL,
        created_at INTEGER NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_rate_events
        ON rate_events(user_id, scope, created_at)"#,
    r#"CREATE TABLE IF NOT EXISTS device_tokens (
        user_id      INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        device_id    TEXT    NOT NULL,
        token        TEXT    NOT NULL,
        platform     TEXT    NOT NULL,
        is_active    INTEGER NOT NULL DEFAULT 1,
        last_used_at INTEGER NOT NULL,
        created_at   INTEGER NOT NULL,
        PRIMARY KEY (user_id, device_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS notification_preferences (
        user_id           INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
        new_message       INTEGER NOT NULL DEFAULT 1,
        message_reaction  INTEGER NOT NULL DEFAULT 1,
        mention           INTEGER NOT NULL DEFAULT 1,
        incoming_call     INTEGER NOT NULL DEFAULT 1,
        missed_call       INTEGER NOT NULL DEFAULT 1,
        group_invite      INTEGER NOT NULL DEFAULT 1,
        channel_post      INTEGER NOT NULL DEFAULT 1,
        security_alert    INTEGER NOT NULL DEFAULT 1,
        dnd_enabled       INTEGER NOT NULL DEFAULT 0,
        dnd_start         TEXT,
        dnd_end           TEXT,
        show_preview      INTEGER NOT NULL DEFAULT 1,
        sound_enabled     INTEGER NOT NULL DEFAULT 1,
        vibration_enabled INTEGER NOT NULL DEFAULT 1
    )"#,
    r#"CREATE TABLE IF NOT EXISTS mute_rules (
        user_id     INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        target_type TEXT    NOT NULL,
        target_id   TEXT    NOT NULL,
        muted_until INTEGER,
        created_at  INTEGER NOT NULL,
        PRIMARY KEY (user_id, target_type, target_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS notifications (
        id                TEXT    PRIMARY KEY,
        recipient_id      INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        sender_id         INTEGER,
        notification_type TEXT    NOT NULL,
        title             TEXT    NOT NULL,
        body              TEXT    NOT NULL,
        data              TEXT    NOT NULL DEFAULT '{}',
        source_type       TEXT,
        source_id         TEXT,
        is_read           INTEGER NOT NULL DEFAULT 0,
        fcm_sent          INTEGER NOT NULL DEFAULT 0,
        fcm_message_id    TEXT,
        fcm_error         TEXT,
        created_at        INTEGER NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_notifications_recipient
        ON notifications(recipient_id, created_at DESC)"#,
    r#"CREATE TABLE IF NOT EXISTS calls (
        id              TEXT    PRIMARY KEY,
        conversation_id TEXT    NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        initiator_id    INTEGER NOT NULL REFERENCES users(id),
        call_type       TEXT    NOT NULL DEFAULT 'audio',
        status          TEXT    NOT NULL DEFAULT 'ringing',
        created_at      INTEGER NOT NULL,
        started_at      INTEGER,
        ended_at        INTEGER,
        duration        INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS call_participants (
        call_id          TEXT    NOT NULL REFERENCES calls(id) ON DELETE CASCADE,
        user_id          INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        joined_at        INTEGER,
        left_at          INTEGER,
        is_muted         INTEGER NOT NULL DEFAULT 0,
        is_video_enabled INTEGER NOT NULL DEFAULT 0,
        is_speaker_on    INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (call_id, user_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS ice_servers (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        server_type TEXT    NOT NULL DEFAULT 'stun',
        urls        TEXT    NOT NULL,
        username    TEXT,
        credential  TEXT,
        is_active   INTEGER NOT NULL DEFAULT 1
    )"#,
    r#"CREATE TABLE IF NOT EXISTS security_alerts (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id     INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        alert_type  TEXT    NOT NULL,
        severity    TEXT    NOT NULL DEFAULT 'medium',
        message     TEXT    NOT NULL,
        metadata    TEXT    NOT NULL DEFAULT '{}',
        is_resolved INTEGER NOT NULL DEFAULT 0,
        resolved_at INTEGER,
        created_at  INTEGER NOT NULL
    )"#,
];

/// Apply the schema. Safe to run on every startup.
pub async fn init(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
