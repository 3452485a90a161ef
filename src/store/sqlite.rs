//! SQLite implementation of the persistence contract. Schema versioning
//! follows the teacher's `sqlite_persistence/versioned_schema.rs` shape
//! (`Table { name, schema, indices }` rows grouped under a
//! `PRAGMA user_version`), extended to every table in section 3.

use super::*;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

struct Table {
    name: &'static str,
    schema: &'static str,
    indices: &'static [&'static str],
}

const TABLES_V0: &[Table] = &[
    Table {
        name: "user",
        schema: "CREATE TABLE user (\
            sub TEXT PRIMARY KEY, \
            email TEXT NOT NULL UNIQUE COLLATE NOCASE, \
            display_name TEXT, \
            wrapped_drk BLOB, \
            created_at INTEGER NOT NULL\
        );",
        indices: &[],
    },
    Table {
        name: "opaque_record",
        schema: "CREATE TABLE opaque_record (\
            sub TEXT PRIMARY KEY REFERENCES user(sub) ON DELETE CASCADE, \
            envelope BLOB NOT NULL, \
            updated_at INTEGER NOT NULL\
        );",
        indices: &[],
    },
    Table {
        name: "client",
        schema: "CREATE TABLE client (\
            client_id TEXT PRIMARY KEY, \
            kind TEXT NOT NULL, \
            redirect_uris TEXT NOT NULL, \
            post_logout_redirect_uris TEXT NOT NULL, \
            require_pkce INTEGER NOT NULL, \
            zk_delivery TEXT NOT NULL, \
            zk_required INTEGER NOT NULL, \
            token_endpoint_auth_method TEXT NOT NULL, \
            encrypted_secret BLOB, \
            allowed_scopes TEXT NOT NULL, \
            allowed_zk_origins TEXT NOT NULL\
        );",
        indices: &[],
    },
    Table {
        name: "signing_key",
        schema: "CREATE TABLE signing_key (\
            kid TEXT PRIMARY KEY, \
            wrapped_private_key BLOB NOT NULL, \
            public_jwk TEXT NOT NULL, \
            created_at INTEGER NOT NULL, \
            active INTEGER NOT NULL, \
            retired INTEGER NOT NULL DEFAULT 0\
        );",
        indices: &[],
    },
    Table {
        name: "pending_auth",
        schema: "CREATE TABLE pending_auth (\
            request_id TEXT PRIMARY KEY, \
            client_id TEXT NOT NULL, \
            redirect_uri TEXT NOT NULL, \
            state TEXT, \
            scope TEXT NOT NULL, \
            code_challenge TEXT, \
            code_challenge_method TEXT, \
            nonce TEXT, \
            zk_pub_kid TEXT, \
            zk_pub_jwk TEXT, \
            user_sub TEXT, \
            otp_elevated INTEGER NOT NULL DEFAULT 0, \
            origin TEXT NOT NULL, \
            created_at INTEGER NOT NULL, \
            expires_at INTEGER NOT NULL\
        );",
        indices: &["CREATE INDEX pending_auth_expires_idx ON pending_auth (expires_at);"],
    },
    Table {
        name: "authorization_code",
        schema: "CREATE TABLE authorization_code (\
            code_hash BLOB PRIMARY KEY, \
            request_id TEXT NOT NULL, \
            user_sub TEXT NOT NULL, \
            scope TEXT NOT NULL, \
            issued_at INTEGER NOT NULL, \
            expires_at INTEGER NOT NULL\
        );",
        indices: &["CREATE INDEX authorization_code_expires_idx ON authorization_code (expires_at);"],
    },
    Table {
        name: "session",
        schema: "CREATE TABLE session (\
            session_id TEXT PRIMARY KEY, \
            domain TEXT NOT NULL, \
            user_sub TEXT NOT NULL, \
            csrf_token TEXT NOT NULL, \
            otp_elevated INTEGER NOT NULL DEFAULT 0, \
            created_at INTEGER NOT NULL, \
            last_seen_at INTEGER NOT NULL, \
            expires_at INTEGER NOT NULL\
        );",
        indices: &[],
    },
    Table {
        name: "opaque_transient_session",
        schema: "CREATE TABLE opaque_transient_session (\
            session_id TEXT PRIMARY KEY, \
            state BLOB NOT NULL, \
            expires_at INTEGER NOT NULL\
        );",
        indices: &[],
    },
    Table {
        name: "otp_record",
        schema: "CREATE TABLE otp_record (\
            identity TEXT PRIMARY KEY, \
            secret_base32 TEXT NOT NULL, \
            verified INTEGER NOT NULL, \
            last_used_step INTEGER NOT NULL DEFAULT -1, \
            backup_code_hashes TEXT NOT NULL DEFAULT '[]'\
        );",
        indices: &[],
    },
    Table {
        name: "settings",
        schema: "CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        indices: &[],
    },
    Table {
        name: "audit",
        schema: "CREATE TABLE audit (\
            id INTEGER PRIMARY KEY AUTOINCREMENT, \
            actor TEXT, \
            event_type TEXT NOT NULL, \
            resource_type TEXT NOT NULL, \
            resource_id TEXT, \
            timestamp INTEGER NOT NULL, \
            outcome TEXT NOT NULL, \
            details TEXT NOT NULL\
        );",
        indices: &[],
    },
    Table {
        name: "group_def",
        schema: "CREATE TABLE group_def (\
            name TEXT PRIMARY KEY, \
            enable_login INTEGER NOT NULL, \
            require_otp INTEGER NOT NULL\
        );",
        indices: &[],
    },
    Table {
        name: "user_group",
        schema: "CREATE TABLE user_group (\
            user_sub TEXT NOT NULL REFERENCES user(sub) ON DELETE CASCADE, \
            group_name TEXT NOT NULL REFERENCES group_def(name) ON DELETE CASCADE, \
            PRIMARY KEY (user_sub, group_name)\
        );",
        indices: &[],
    },
    Table {
        name: "role_def",
        schema: "CREATE TABLE role_def (\
            name TEXT PRIMARY KEY, \
            require_otp INTEGER NOT NULL, \
            permissions TEXT NOT NULL DEFAULT '[]'\
        );",
        indices: &[],
    },
    Table {
        name: "user_role",
        schema: "CREATE TABLE user_role (\
            user_sub TEXT NOT NULL REFERENCES user(sub) ON DELETE CASCADE, \
            role_name TEXT NOT NULL REFERENCES role_def(name) ON DELETE CASCADE, \
            PRIMARY KEY (user_sub, role_name)\
        );",
        indices: &[],
    },
    Table {
        name: "rate_limit",
        schema: "CREATE TABLE rate_limit (\
            bucket_key TEXT PRIMARY KEY, \
            window_start INTEGER NOT NULL, \
            count INTEGER NOT NULL\
        );",
        indices: &[],
    },
];

const BASE_DB_VERSION: i64 = 1;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, AppError> {
        let fresh = !db_path.as_ref().exists();
        let conn = Connection::open(db_path).map_err(|_| AppError::Internal)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|_| AppError::Internal)?;

        if fresh {
            Self::create_schema(&conn)?;
        } else {
            let version: i64 = conn
                .query_row("PRAGMA user_version;", [], |row| row.get(0))
                .map_err(|_| AppError::Internal)?;
            if version != BASE_DB_VERSION {
                return Err(AppError::Internal);
            }
        }

        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory().map_err(|_| AppError::Internal)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|_| AppError::Internal)?;
        Self::create_schema(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn create_schema(conn: &Connection) -> Result<(), AppError> {
        for table in TABLES_V0 {
            conn.execute(table.schema, []).map_err(|_| AppError::Internal)?;
            for index in table.indices {
                conn.execute(index, []).map_err(|_| AppError::Internal)?;
            }
        }
        conn.pragma_update(None, "user_version", BASE_DB_VERSION)
            .map_err(|_| AppError::Internal)?;
        Ok(())
    }
}

fn json_col<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

fn parse_json_col<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_default()
}

fn client_kind_str(kind: ClientKind) -> &'static str {
    match kind {
        ClientKind::Public => "public",
        ClientKind::Confidential => "confidential",
    }
}

fn parse_client_kind(raw: &str) -> ClientKind {
    match raw {
        "confidential" => ClientKind::Confidential,
        _ => ClientKind::Public,
    }
}

fn zk_delivery_str(zk: ZkDelivery) -> &'static str {
    match zk {
        ZkDelivery::None => "none",
        ZkDelivery::FragmentJwe => "fragment-jwe",
    }
}

fn parse_zk_delivery(raw: &str) -> ZkDelivery {
    match raw {
        "fragment-jwe" => ZkDelivery::FragmentJwe,
        _ => ZkDelivery::None,
    }
}

fn session_domain_str(domain: SessionDomain) -> &'static str {
    match domain {
        SessionDomain::User => "user",
        SessionDomain::Admin => "admin",
    }
}

fn parse_session_domain(raw: &str) -> SessionDomain {
    match raw {
        "admin" => SessionDomain::Admin,
        _ => SessionDomain::User,
    }
}

fn audit_outcome_str(outcome: AuditOutcome) -> &'static str {
    match outcome {
        AuditOutcome::Success => "success",
        AuditOutcome::Failure => "failure",
    }
}

impl UserRepository for SqliteStore {
    fn user_get_by_sub(&self, sub: &str) -> Result<Option<UserRow>, AppError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT sub, email, display_name, wrapped_drk, created_at FROM user WHERE sub = ?1",
            params![sub],
            |row| {
                Ok(UserRow {
                    sub: row.get(0)?,
                    email: row.get(1)?,
                    display_name: row.get(2)?,
                    wrapped_drk: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    fn user_get_by_email(&self, email: &str) -> Result<Option<UserRow>, AppError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT sub, email, display_name, wrapped_drk, created_at FROM user WHERE email = ?1 COLLATE NOCASE",
            params![email],
            |row| {
                Ok(UserRow {
                    sub: row.get(0)?,
                    email: row.get(1)?,
                    display_name: row.get(2)?,
                    wrapped_drk: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    fn user_create(&self, user: UserRow) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO user (sub, email, display_name, wrapped_drk, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user.sub, user.email, user.display_name, user.wrapped_drk, user.created_at],
        )
        .map_err(|err| match err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                AppError::Conflict("email already registered".to_string())
            }
            other => AppError::from(other),
        })?;
        Ok(())
    }

    fn user_update(&self, user: UserRow) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE user SET email = ?2, display_name = ?3, wrapped_drk = ?4 WHERE sub = ?1",
            params![user.sub, user.email, user.display_name, user.wrapped_drk],
        )?;
        Ok(())
    }

    fn user_delete(&self, sub: &str) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM user WHERE sub = ?1", params![sub])?;
        Ok(())
    }

    fn user_groups(&self, sub: &str) -> Result<Vec<GroupRow>, AppError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT g.name, g.enable_login, g.require_otp FROM group_def g \
             JOIN user_group ug ON ug.group_name = g.name WHERE ug.user_sub = ?1",
        )?;
        let rows = stmt
            .query_map(params![sub], |row| {
                Ok(GroupRow {
                    name: row.get(0)?,
                    enable_login: row.get::<_, i64>(1)? != 0,
                    require_otp: row.get::<_, i64>(2)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn user_roles(&self, sub: &str) -> Result<Vec<RoleRow>, AppError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT r.name, r.require_otp, r.permissions FROM role_def r \
             JOIN user_role ur ON ur.role_name = r.name WHERE ur.user_sub = ?1",
        )?;
        let rows = stmt
            .query_map(params![sub], |row| {
                let permissions_raw: String = row.get(2)?;
                Ok(RoleRow {
                    name: row.get(0)?,
                    require_otp: row.get::<_, i64>(1)? != 0,
                    permissions: parse_json_col(&permissions_raw),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl OpaqueRecordRepository for SqliteStore {
    fn opaque_record_get(&self, sub: &str) -> Result<Option<OpaqueRecordRow>, AppError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT sub, envelope, updated_at FROM opaque_record WHERE sub = ?1",
            params![sub],
            |row| {
                Ok(OpaqueRecordRow {
                    sub: row.get(0)?,
                    envelope: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    fn opaque_record_upsert(&self, record: OpaqueRecordRow) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO opaque_record (sub, envelope, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(sub) DO UPDATE SET envelope = excluded.envelope, updated_at = excluded.updated_at",
            params![record.sub, record.envelope, record.updated_at],
        )?;
        Ok(())
    }

    fn opaque_record_delete(&self, sub: &str) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM opaque_record WHERE sub = ?1", params![sub])?;
        Ok(())
    }
}

impl ClientRepository for SqliteStore {
    fn client_get(&self, client_id: &str) -> Result<Option<ClientRow>, AppError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT client_id, kind, redirect_uris, post_logout_redirect_uris, require_pkce, \
             zk_delivery, zk_required, token_endpoint_auth_method, encrypted_secret, \
             allowed_scopes, allowed_zk_origins FROM client WHERE client_id = ?1",
            params![client_id],
            row_to_client,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn client_list(&self) -> Result<Vec<ClientRow>, AppError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT client_id, kind, redirect_uris, post_logout_redirect_uris, require_pkce, \
             zk_delivery, zk_required, token_endpoint_auth_method, encrypted_secret, \
             allowed_scopes, allowed_zk_origins FROM client",
        )?;
        let rows = stmt.query_map([], row_to_client)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn client_upsert(&self, client: ClientRow) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO client (client_id, kind, redirect_uris, post_logout_redirect_uris, \
             require_pkce, zk_delivery, zk_required, token_endpoint_auth_method, \
             encrypted_secret, allowed_scopes, allowed_zk_origins) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(client_id) DO UPDATE SET \
               kind = excluded.kind, redirect_uris = excluded.redirect_uris, \
               post_logout_redirect_uris = excluded.post_logout_redirect_uris, \
               require_pkce = excluded.require_pkce, zk_delivery = excluded.zk_delivery, \
               zk_required = excluded.zk_required, \
               token_endpoint_auth_method = excluded.token_endpoint_auth_method, \
               encrypted_secret = excluded.encrypted_secret, \
               allowed_scopes = excluded.allowed_scopes, \
               allowed_zk_origins = excluded.allowed_zk_origins",
            params![
                client.client_id,
                client_kind_str(client.kind),
                json_col(&client.redirect_uris),
                json_col(&client.post_logout_redirect_uris),
                client.require_pkce,
                zk_delivery_str(client.zk_delivery),
                client.zk_required,
                client.token_endpoint_auth_method,
                client.encrypted_secret,
                json_col(&client.allowed_scopes),
                json_col(&client.allowed_zk_origins),
            ],
        )?;
        Ok(())
    }

    fn client_delete(&self, client_id: &str) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM client WHERE client_id = ?1", params![client_id])?;
        Ok(())
    }
}

fn row_to_client(row: &rusqlite::Row) -> rusqlite::Result<ClientRow> {
    let redirect_uris_raw: String = row.get(2)?;
    let post_logout_raw: String = row.get(3)?;
    let allowed_scopes_raw: String = row.get(9)?;
    let allowed_zk_origins_raw: String = row.get(10)?;
    let kind_raw: String = row.get(1)?;
    let zk_raw: String = row.get(5)?;
    Ok(ClientRow {
        client_id: row.get(0)?,
        kind: parse_client_kind(&kind_raw),
        redirect_uris: parse_json_col(&redirect_uris_raw),
        post_logout_redirect_uris: parse_json_col(&post_logout_raw),
        require_pkce: row.get::<_, i64>(4)? != 0,
        zk_delivery: parse_zk_delivery(&zk_raw),
        zk_required: row.get::<_, i64>(6)? != 0,
        token_endpoint_auth_method: row.get(7)?,
        encrypted_secret: row.get(8)?,
        allowed_scopes: parse_json_col(&allowed_scopes_raw),
        allowed_zk_origins: parse_json_col(&allowed_zk_origins_raw),
    })
}

impl SigningKeyRepository for SqliteStore {
    fn signing_keys_get_active(&self) -> Result<Option<SigningKeyRow>, AppError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT kid, wrapped_private_key, public_jwk, created_at, active FROM signing_key \
             WHERE active = 1 LIMIT 1",
            [],
            row_to_signing_key,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn signing_keys_list_non_retired(&self) -> Result<Vec<SigningKeyRow>, AppError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT kid, wrapped_private_key, public_jwk, created_at, active FROM signing_key \
             WHERE retired = 0 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_signing_key)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn signing_keys_list_all(&self) -> Result<Vec<SigningKeyRow>, AppError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT kid, wrapped_private_key, public_jwk, created_at, active FROM signing_key \
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_signing_key)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn signing_keys_insert(&self, key: SigningKeyRow) -> Result<(), AppError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|_| AppError::Internal)?;
        if key.active {
            tx.execute("UPDATE signing_key SET active = 0 WHERE active = 1", [])?;
        }
        tx.execute(
            "INSERT INTO signing_key (kid, wrapped_private_key, public_jwk, created_at, active) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.kid,
                key.wrapped_private_key,
                key.public_jwk,
                key.created_at,
                key.active,
            ],
        )?;
        tx.commit().map_err(|_| AppError::Internal)?;
        Ok(())
    }

    fn signing_keys_retire(&self, kid: &str) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE signing_key SET retired = 1, active = 0 WHERE kid = ?1",
            params![kid],
        )?;
        Ok(())
    }
}

fn row_to_signing_key(row: &rusqlite::Row) -> rusqlite::Result<SigningKeyRow> {
    Ok(SigningKeyRow {
        kid: row.get(0)?,
        wrapped_private_key: row.get(1)?,
        public_jwk: row.get(2)?,
        created_at: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
    })
}

impl PendingAuthRepository for SqliteStore {
    fn pending_auth_create(&self, row: PendingAuthRow) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pending_auth (request_id, client_id, redirect_uri, state, scope, \
             code_challenge, code_challenge_method, nonce, zk_pub_kid, zk_pub_jwk, user_sub, \
             otp_elevated, origin, created_at, expires_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                row.request_id,
                row.client_id,
                row.redirect_uri,
                row.state,
                row.scope,
                row.code_challenge,
                row.code_challenge_method,
                row.nonce,
                row.zk_pub_kid,
                row.zk_pub_jwk,
                row.user_sub,
                row.otp_elevated,
                row.origin,
                row.created_at,
                row.expires_at,
            ],
        )?;
        Ok(())
    }

    fn pending_auth_get(&self, request_id: &str) -> Result<Option<PendingAuthRow>, AppError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT request_id, client_id, redirect_uri, state, scope, code_challenge, \
             code_challenge_method, nonce, zk_pub_kid, zk_pub_jwk, user_sub, otp_elevated, origin, \
             created_at, expires_at FROM pending_auth WHERE request_id = ?1",
            params![request_id],
            row_to_pending_auth,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn pending_auth_bind_subject(&self, request_id: &str, sub: &str) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pending_auth SET user_sub = ?2 WHERE request_id = ?1",
            params![request_id, sub],
        )?;
        Ok(())
    }

    fn pending_auth_set_otp_elevated(&self, request_id: &str) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pending_auth SET otp_elevated = 1 WHERE request_id = ?1",
            params![request_id],
        )?;
        Ok(())
    }

    fn pending_auth_consume(&self, request_id: &str) -> Result<Option<PendingAuthRow>, AppError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|_| AppError::Internal)?;
        let row = tx
            .query_row(
                "SELECT request_id, client_id, redirect_uri, state, scope, code_challenge, \
                 code_challenge_method, nonce, zk_pub_kid, zk_pub_jwk, user_sub, otp_elevated, \
                 origin, created_at, expires_at FROM pending_auth WHERE request_id = ?1",
                params![request_id],
                row_to_pending_auth,
            )
            .optional()?;
        if row.is_some() {
            tx.execute("DELETE FROM pending_auth WHERE request_id = ?1", params![request_id])?;
        }
        tx.commit().map_err(|_| AppError::Internal)?;
        Ok(row)
    }

    fn pending_auth_sweep_expired(&self, now: i64) -> Result<u64, AppError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM pending_auth WHERE expires_at <= ?1", params![now])?;
        Ok(n as u64)
    }
}

fn row_to_pending_auth(row: &rusqlite::Row) -> rusqlite::Result<PendingAuthRow> {
    Ok(PendingAuthRow {
        request_id: row.get(0)?,
        client_id: row.get(1)?,
        redirect_uri: row.get(2)?,
        state: row.get(3)?,
        scope: row.get(4)?,
        code_challenge: row.get(5)?,
        code_challenge_method: row.get(6)?,
        nonce: row.get(7)?,
        zk_pub_kid: row.get(8)?,
        zk_pub_jwk: row.get(9)?,
        user_sub: row.get(10)?,
        otp_elevated: row.get::<_, i64>(11)? != 0,
        origin: row.get(12)?,
        created_at: row.get(13)?,
        expires_at: row.get(14)?,
    })
}

impl CodeRepository for SqliteStore {
    fn code_create(&self, row: AuthorizationCodeRow) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO authorization_code (code_hash, request_id, user_sub, scope, issued_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![row.code_hash, row.request_id, row.user_sub, row.scope, row.issued_at, row.expires_at],
        )?;
        Ok(())
    }

    /// Delete-returning so two concurrent redemptions of the same code
    /// serialize on the SQLite connection mutex and exactly one sees the
    /// row (section 5 ordering guarantee, section 8 invariant 1).
    fn code_consume(&self, code_hash: &[u8]) -> Result<Option<AuthorizationCodeRow>, AppError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|_| AppError::Internal)?;
        let row = tx
            .query_row(
                "SELECT code_hash, request_id, user_sub, scope, issued_at, expires_at \
                 FROM authorization_code WHERE code_hash = ?1",
                params![code_hash],
                |row| {
                    Ok(AuthorizationCodeRow {
                        code_hash: row.get(0)?,
                        request_id: row.get(1)?,
                        user_sub: row.get(2)?,
                        scope: row.get(3)?,
                        issued_at: row.get(4)?,
                        expires_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        if row.is_some() {
            tx.execute("DELETE FROM authorization_code WHERE code_hash = ?1", params![code_hash])?;
        }
        tx.commit().map_err(|_| AppError::Internal)?;
        Ok(row)
    }

    fn code_sweep_expired(&self, now: i64) -> Result<u64, AppError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM authorization_code WHERE expires_at <= ?1", params![now])?;
        Ok(n as u64)
    }
}

impl SessionRepository for SqliteStore {
    fn session_create(&self, row: SessionRow) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO session (session_id, domain, user_sub, csrf_token, otp_elevated, \
             created_at, last_seen_at, expires_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                row.session_id,
                session_domain_str(row.domain),
                row.user_sub,
                row.csrf_token,
                row.otp_elevated,
                row.created_at,
                row.last_seen_at,
                row.expires_at,
            ],
        )?;
        Ok(())
    }

    fn session_get(&self, session_id: &str) -> Result<Option<SessionRow>, AppError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT session_id, domain, user_sub, csrf_token, otp_elevated, created_at, \
             last_seen_at, expires_at FROM session WHERE session_id = ?1",
            params![session_id],
            row_to_session,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn session_touch(&self, session_id: &str, last_seen_at: i64) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE session SET last_seen_at = ?2 WHERE session_id = ?1",
            params![session_id, last_seen_at],
        )?;
        Ok(())
    }

    fn session_delete(&self, session_id: &str) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM session WHERE session_id = ?1", params![session_id])?;
        Ok(())
    }

    fn session_mark_otp_elevated(&self, session_id: &str) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE session SET otp_elevated = 1 WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<SessionRow> {
    let domain_raw: String = row.get(1)?;
    Ok(SessionRow {
        session_id: row.get(0)?,
        domain: parse_session_domain(&domain_raw),
        user_sub: row.get(2)?,
        csrf_token: row.get(3)?,
        otp_elevated: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        last_seen_at: row.get(6)?,
        expires_at: row.get(7)?,
    })
}

impl OpaqueTransientSessionRepository for SqliteStore {
    fn opaque_session_create(
        &self,
        session_id: &str,
        state: Vec<u8>,
        expires_at: i64,
    ) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO opaque_transient_session (session_id, state, expires_at) VALUES (?1, ?2, ?3)",
            params![session_id, state, expires_at],
        )?;
        Ok(())
    }

    /// Unconditionally deletes on read, so a `sessionId` is never reusable
    /// (section 4.C invariants, section 8 invariant 3).
    fn opaque_session_take(&self, session_id: &str) -> Result<Option<Vec<u8>>, AppError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|_| AppError::Internal)?;
        let state: Option<Vec<u8>> = tx
            .query_row(
                "SELECT state FROM opaque_transient_session WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        if state.is_some() {
            tx.execute(
                "DELETE FROM opaque_transient_session WHERE session_id = ?1",
                params![session_id],
            )?;
        }
        tx.commit().map_err(|_| AppError::Internal)?;
        Ok(state)
    }

    fn opaque_session_sweep_expired(&self, now: i64) -> Result<u64, AppError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM opaque_transient_session WHERE expires_at <= ?1",
            params![now],
        )?;
        Ok(n as u64)
    }
}

impl OtpRepository for SqliteStore {
    fn otp_get(&self, identity: &str) -> Result<Option<OtpRecordRow>, AppError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT identity, secret_base32, verified, last_used_step, backup_code_hashes \
             FROM otp_record WHERE identity = ?1",
            params![identity],
            row_to_otp,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn otp_upsert(&self, record: OtpRecordRow) -> Result<(), AppError> {
        let backup_hashes_b64: Vec<String> = record
            .backup_code_hashes
            .iter()
            .map(|h| crate::crypto::b64u_encode(h))
            .collect();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO otp_record (identity, secret_base32, verified, last_used_step, backup_code_hashes) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(identity) DO UPDATE SET \
               secret_base32 = excluded.secret_base32, verified = excluded.verified, \
               last_used_step = excluded.last_used_step, backup_code_hashes = excluded.backup_code_hashes",
            params![
                record.identity,
                record.secret_base32,
                record.verified,
                record.last_used_step,
                json_col(&backup_hashes_b64),
            ],
        )?;
        Ok(())
    }

    fn otp_delete(&self, identity: &str) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM otp_record WHERE identity = ?1", params![identity])?;
        Ok(())
    }

    fn otp_consume_backup_code(&self, identity: &str, code_hash: &[u8]) -> Result<bool, AppError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|_| AppError::Internal)?;
        let raw: Option<String> = tx
            .query_row(
                "SELECT backup_code_hashes FROM otp_record WHERE identity = ?1",
                params![identity],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            tx.commit().map_err(|_| AppError::Internal)?;
            return Ok(false);
        };
        let mut hashes: Vec<String> = parse_json_col(&raw);
        let target = crate::crypto::b64u_encode(code_hash);
        let before = hashes.len();
        hashes.retain(|h| h != &target);
        let matched = hashes.len() != before;
        if matched {
            tx.execute(
                "UPDATE otp_record SET backup_code_hashes = ?2 WHERE identity = ?1",
                params![identity, json_col(&hashes)],
            )?;
        }
        tx.commit().map_err(|_| AppError::Internal)?;
        Ok(matched)
    }
}

fn row_to_otp(row: &rusqlite::Row) -> rusqlite::Result<OtpRecordRow> {
    let backup_raw: String = row.get(4)?;
    let backup_b64: Vec<String> = parse_json_col(&backup_raw);
    let backup_code_hashes = backup_b64
        .iter()
        .filter_map(|s| crate::crypto::b64u_decode(s).ok())
        .collect();
    Ok(OtpRecordRow {
        identity: row.get(0)?,
        secret_base32: row.get(1)?,
        verified: row.get::<_, i64>(2)? != 0,
        last_used_step: row.get(3)?,
        backup_code_hashes,
    })
}

impl SettingsRepository for SqliteStore {
    fn settings_get(&self, key: &str) -> Result<Option<String>, AppError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(AppError::from)
    }

    fn settings_set(&self, key: &str, value: &str) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn settings_list(&self) -> Result<Vec<(String, String)>, AppError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl AuditRepository for SqliteStore {
    fn audit_write(&self, entry: AuditEntry) -> Result<(), AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit (actor, event_type, resource_type, resource_id, timestamp, outcome, details) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.actor,
                entry.event_type,
                entry.resource_type,
                entry.resource_id,
                entry.timestamp,
                audit_outcome_str(entry.outcome),
                entry.details.to_string(),
            ],
        )?;
        Ok(())
    }
}

/// Fixed-window identity counters (section 5: `incr(key, window) →
/// count`). Each window is keyed by its own bucket row so a new window
/// starts the count at 1 rather than requiring a sweep.
impl RateLimitRepository for SqliteStore {
    fn rate_limit_incr(&self, key: &str, now: i64, window_secs: i64) -> Result<i64, AppError> {
        let window_start = (now / window_secs) * window_secs;
        let bucket_key = format!("{key}:{window_start}");
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO rate_limit (bucket_key, window_start, count) VALUES (?1, ?2, 1) \
             ON CONFLICT(bucket_key) DO UPDATE SET count = count + 1",
            params![bucket_key, window_start],
        )?;
        let count: i64 = conn.query_row(
            "SELECT count FROM rate_limit WHERE bucket_key = ?1",
            params![bucket_key],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn user(sub: &str, email: &str) -> UserRow {
        UserRow {
            sub: sub.to_string(),
            email: email.to_string(),
            display_name: None,
            wrapped_drk: None,
            created_at: 1_000,
        }
    }

    #[test]
    fn user_email_uniqueness_is_case_insensitive() {
        let store = store();
        store.user_create(user("sub-1", "a@example.com")).unwrap();
        let err = store
            .user_create(user("sub-2", "A@EXAMPLE.COM"))
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn code_consume_is_at_most_once() {
        let store = store();
        let hash = vec![1, 2, 3];
        store
            .code_create(AuthorizationCodeRow {
                code_hash: hash.clone(),
                request_id: "req-1".to_string(),
                user_sub: "sub-1".to_string(),
                scope: "openid".to_string(),
                issued_at: 0,
                expires_at: 60,
            })
            .unwrap();

        assert!(store.code_consume(&hash).unwrap().is_some());
        assert!(store.code_consume(&hash).unwrap().is_none());
    }

    #[test]
    fn opaque_transient_session_is_single_use() {
        let store = store();
        store
            .opaque_session_create("sess-1", vec![9, 9, 9], 120)
            .unwrap();
        assert_eq!(store.opaque_session_take("sess-1").unwrap(), Some(vec![9, 9, 9]));
        assert_eq!(store.opaque_session_take("sess-1").unwrap(), None);
    }

    #[test]
    fn backup_code_is_single_use() {
        let store = store();
        let hash = crate::crypto::sha256(b"ABCD-1234").to_vec();
        store
            .otp_upsert(OtpRecordRow {
                identity: "sub-1".to_string(),
                secret_base32: "JBSWY3DPEHPK3PXP".to_string(),
                verified: true,
                last_used_step: -1,
                backup_code_hashes: vec![hash.clone()],
            })
            .unwrap();

        assert!(store.otp_consume_backup_code("sub-1", &hash).unwrap());
        assert!(!store.otp_consume_backup_code("sub-1", &hash).unwrap());
    }

    #[test]
    fn signing_key_rotation_keeps_previous_key_listed() {
        let store = store();
        store
            .signing_keys_insert(SigningKeyRow {
                kid: "key-1".to_string(),
                wrapped_private_key: vec![1],
                public_jwk: "{}".to_string(),
                created_at: 0,
                active: true,
            })
            .unwrap();
        store
            .signing_keys_insert(SigningKeyRow {
                kid: "key-2".to_string(),
                wrapped_private_key: vec![2],
                public_jwk: "{}".to_string(),
                created_at: 1,
                active: true,
            })
            .unwrap();

        let active = store.signing_keys_get_active().unwrap().unwrap();
        assert_eq!(active.kid, "key-2");
        let all_non_retired = store.signing_keys_list_non_retired().unwrap();
        assert_eq!(all_non_retired.len(), 2);
    }

    #[test]
    fn rate_limit_incr_counts_within_a_window_and_resets_in_the_next() {
        let store = store();
        assert_eq!(store.rate_limit_incr("login:alice", 1_000, 60).unwrap(), 1);
        assert_eq!(store.rate_limit_incr("login:alice", 1_010, 60).unwrap(), 2);
        assert_eq!(store.rate_limit_incr("login:alice", 1_059, 60).unwrap(), 3);
        // Next window starts fresh.
        assert_eq!(store.rate_limit_incr("login:alice", 1_060, 60).unwrap(), 1);
    }
}
