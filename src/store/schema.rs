//! SQLite Schema 初始化子模块
//!
//! ## 职责
//! - 创建记录表与分页索引
//! - 通过触发器保证记录写入后不可修改、不可删除
//! - 写入键列 + 唯一索引，手动重试写入时按键去重
//! - 维护 `PRAGMA user_version`
//!
//! ## 错误语义
//! - DDL 失败统一映射为 `PersistenceError::Database`

use rusqlite::Connection;

use super::PersistenceError;

pub(super) const SCHEMA_VERSION: i64 = 3;

fn get_user_version(conn: &Connection) -> Result<i64, PersistenceError> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| PersistenceError::Database(format!("读取数据库版本失败: {}", e)))
}

fn set_user_version(conn: &Connection, version: i64) -> Result<(), PersistenceError> {
    conn.execute_batch(&format!("PRAGMA user_version = {version};"))
        .map_err(|e| PersistenceError::Database(format!("写入数据库版本失败: {}", e)))
}

fn create_record_table(conn: &Connection) -> Result<(), PersistenceError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS analysis_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            animal TEXT NOT NULL,
            breed TEXT NOT NULL,
            body_type TEXT NOT NULL,
            frame_type TEXT NOT NULL,
            estimated_weight REAL NOT NULL CHECK (estimated_weight > 0),
            weight_range TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_records_created_id
            ON analysis_records(created_at DESC, id DESC);"
    ).map_err(|e| PersistenceError::Database(format!("创建记录表失败: {}", e)))
}

fn create_immutability_triggers(conn: &Connection) -> Result<(), PersistenceError> {
    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS trg_records_no_update
            BEFORE UPDATE ON analysis_records
         BEGIN
            SELECT RAISE(ABORT, 'analysis records are immutable');
         END;
         CREATE TRIGGER IF NOT EXISTS trg_records_no_delete
            BEFORE DELETE ON analysis_records
         BEGIN
            SELECT RAISE(ABORT, 'analysis records are immutable');
         END;"
    ).map_err(|e| PersistenceError::Database(format!("创建只读触发器失败: {}", e)))
}

fn add_write_key_column(conn: &Connection) -> Result<(), PersistenceError> {
    conn.execute_batch(
        "ALTER TABLE analysis_records ADD COLUMN write_key TEXT;
         CREATE UNIQUE INDEX IF NOT EXISTS idx_records_write_key
            ON analysis_records(write_key) WHERE write_key IS NOT NULL;"
    ).map_err(|e| PersistenceError::Database(format!("添加写入键列失败: {}", e)))
}

pub(super) fn initialize_schema(conn: &Connection) -> Result<(), PersistenceError> {
    conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

    create_record_table(conn)?;

    let mut version = get_user_version(conn)?;
    if version < 1 {
        set_user_version(conn, 1)?;
        version = 1;
    }

    if version < 2 {
        create_immutability_triggers(conn)?;
        set_user_version(conn, 2)?;
        version = 2;
    }

    if version < 3 {
        add_write_key_column(conn)?;
        set_user_version(conn, 3)?;
        version = 3;
    }

    if version != SCHEMA_VERSION {
        return Err(PersistenceError::Database(format!(
            "数据库版本不匹配: current={}, expected={}",
            version, SCHEMA_VERSION
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::initialize_schema;

    #[test]
    fn initialize_schema_is_idempotent() {
        let conn = Connection::open_in_memory().expect("create memory db");

        initialize_schema(&conn).expect("first init should succeed");
        initialize_schema(&conn).expect("second init should succeed");

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='analysis_records'",
                [],
                |row| row.get(0),
            )
            .expect("query table count");
        assert_eq!(count, 1);

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .expect("query user_version");
        assert_eq!(version, super::SCHEMA_VERSION);
    }

    #[test]
    fn records_cannot_be_updated_or_deleted() {
        let conn = Connection::open_in_memory().expect("create memory db");
        initialize_schema(&conn).expect("init should succeed");

        conn.execute(
            "INSERT INTO analysis_records
                (animal, breed, body_type, frame_type, estimated_weight, weight_range, created_at)
             VALUES ('dog', 'beagle', 'lean', 'medium', 12.5, '10-14kg', 1)",
            [],
        )
        .expect("insert record");

        assert!(conn.execute("UPDATE analysis_records SET breed = 'pug'", []).is_err());
        assert!(conn.execute("DELETE FROM analysis_records", []).is_err());
    }

    #[test]
    fn migrates_v1_database_to_current_version() {
        let conn = Connection::open_in_memory().expect("create memory db");
        conn.execute_batch(
            "CREATE TABLE analysis_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                animal TEXT NOT NULL,
                breed TEXT NOT NULL,
                body_type TEXT NOT NULL,
                frame_type TEXT NOT NULL,
                estimated_weight REAL NOT NULL CHECK (estimated_weight > 0),
                weight_range TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            PRAGMA user_version = 1;"
        )
        .expect("prepare legacy v1 schema");

        initialize_schema(&conn).expect("migrate v1");

        let triggers: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='trigger' AND name LIKE 'trg_records_%'",
                [],
                |row| row.get(0),
            )
            .expect("query triggers");
        assert_eq!(triggers, 2);

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .expect("query user_version");
        assert_eq!(version, super::SCHEMA_VERSION);
    }

    #[test]
    fn write_key_is_unique_but_optional() {
        let conn = Connection::open_in_memory().expect("create memory db");
        initialize_schema(&conn).expect("init should succeed");

        let insert = "INSERT INTO analysis_records
                (animal, breed, body_type, frame_type, estimated_weight, weight_range, created_at, write_key)
             VALUES ('dog', 'beagle', 'lean', 'medium', 12.5, '10-14kg', 1, ?1)";

        conn.execute(insert, [Some("k1")]).expect("first keyed insert");
        assert!(conn.execute(insert, [Some("k1")]).is_err());
        conn.execute(insert, [None::<&str>]).expect("unkeyed insert");
        conn.execute(insert, [None::<&str>]).expect("second unkeyed insert");
    }
}
