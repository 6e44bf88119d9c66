pub const SCHEMA: &str = r#"
-- Named logical databases (vector or graph collections)
CREATE TABLE IF NOT EXISTS databases (
    name TEXT PRIMARY KEY,
    db_type TEXT NOT NULL,            -- vector | graph
    owner TEXT NOT NULL,
    visibility TEXT NOT NULL DEFAULT 'private',

    -- Stats (reported by collaborators that persist items)
    item_count INTEGER NOT NULL DEFAULT 0,
    size_bytes INTEGER NOT NULL DEFAULT 0,

    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now'))
);

-- Role grants; the owner is implicit and never stored here
CREATE TABLE IF NOT EXISTS permission_grants (
    database_name TEXT NOT NULL REFERENCES databases(name) ON DELETE CASCADE,
    user TEXT NOT NULL,
    role INTEGER NOT NULL,            -- 1 = reader, 2 = writer, 3 = owner
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now')),
    PRIMARY KEY (database_name, user)
);

-- Virtual folders (materialized path, root '/' is implicit)
CREATE TABLE IF NOT EXISTS folders (
    database_name TEXT NOT NULL REFERENCES databases(name) ON DELETE CASCADE,
    path TEXT NOT NULL,
    name TEXT NOT NULL,
    file_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now')),
    PRIMARY KEY (database_name, path)
);

-- Invitations: pending -> accepted | rejected | revoked
CREATE TABLE IF NOT EXISTS invitations (
    id TEXT PRIMARY KEY,
    database_name TEXT NOT NULL REFERENCES databases(name) ON DELETE CASCADE,
    inviter TEXT NOT NULL,
    invitee TEXT NOT NULL,
    role INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    message TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    expires_at TEXT,                  -- NULL = never
    accepted_at TEXT,
    responded_at TEXT,
    revoked_at TEXT
);

-- Bearer access tokens
CREATE TABLE IF NOT EXISTS access_tokens (
    id TEXT PRIMARY KEY,
    token_hash TEXT NOT NULL,         -- argon2id hash with embedded salt
    token_lookup TEXT NOT NULL,       -- 8 chars for fast lookup
    database_name TEXT NOT NULL REFERENCES databases(name) ON DELETE CASCADE,
    issuer TEXT NOT NULL,
    role INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    description TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    expires_at TEXT NOT NULL,
    revoked_at TEXT,
    usage_count INTEGER NOT NULL DEFAULT 0,
    max_uses INTEGER                  -- NULL = unlimited
);

-- Distinct redeemers per token
CREATE TABLE IF NOT EXISTS token_redemptions (
    token_id TEXT NOT NULL REFERENCES access_tokens(id) ON DELETE CASCADE,
    user TEXT NOT NULL,
    first_used_at TEXT DEFAULT (datetime('now')),
    PRIMARY KEY (token_id, user)
);

-- Per-recipient notifications
CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    user TEXT NOT NULL,
    kind TEXT NOT NULL,
    message TEXT NOT NULL,
    data TEXT NOT NULL DEFAULT '{}',  -- JSON object
    created_at TEXT DEFAULT (datetime('now')),
    read INTEGER NOT NULL DEFAULT 0,
    read_at TEXT
);

-- Create indexes
CREATE INDEX IF NOT EXISTS idx_databases_owner ON databases(owner);
CREATE INDEX IF NOT EXISTS idx_grants_user ON permission_grants(user);
CREATE INDEX IF NOT EXISTS idx_invitations_invitee ON invitations(invitee);
CREATE INDEX IF NOT EXISTS idx_invitations_inviter ON invitations(inviter);
CREATE INDEX IF NOT EXISTS idx_invitations_database ON invitations(database_name);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tokens_lookup ON access_tokens(token_lookup);
CREATE INDEX IF NOT EXISTS idx_tokens_database ON access_tokens(database_name);
CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user);
"#;
