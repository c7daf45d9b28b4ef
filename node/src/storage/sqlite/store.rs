use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::config::StorageConfig;
use crate::storage::{
    ChangeSet, OffsetType, Persistence, PostCommitListener, Query, StagedMessage, StorageError,
    StorageResult, StorageTxn, TxnWork,
};
use crate::types::message::MessageRecord;
use crate::types::{
    Batch, BatchRecord, BatchType, Data, Event, EventType, Group, Message, MessageState, Operation,
    Pin, PinState, Subscription, Transaction,
};
use crate::utilities::hash::HashType;
use crate::utilities::time::now_millis;
use crate::utilities::EntityId;

const MESSAGE_COLUMNS: &[&str] = &[
    "id", "namespace", "author", "group_hash", "mtype", "state", "tag", "cid", "hash", "batch_id",
    "created",
];
const OPERATION_COLUMNS: &[&str] = &[
    "id", "namespace", "tx_id", "otype", "plugin", "idem_key", "status", "created", "updated",
];
const PIN_COLUMNS: &[&str] = &[
    "namespace",
    "batch_id",
    "context",
    "signer",
    "nonce",
    "batch_index",
    "sequence",
    "payload_ref",
    "batch_hash",
    "state",
    "created",
];
const EVENT_COLUMNS: &[&str] = &[
    "sequence",
    "id",
    "namespace",
    "etype",
    "reference",
    "tx_id",
    "topic",
    "created",
];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id         TEXT PRIMARY KEY,
    namespace  TEXT NOT NULL,
    author     TEXT NOT NULL,
    group_hash TEXT,
    mtype      TEXT NOT NULL,
    state      TEXT NOT NULL,
    tag        TEXT,
    cid        TEXT,
    hash       TEXT NOT NULL,
    batch_id   TEXT,
    created    INTEGER NOT NULL,
    payload    BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_dispatch
    ON messages (namespace, state, author, created);

CREATE TABLE IF NOT EXISTS data (
    id        TEXT PRIMARY KEY,
    namespace TEXT NOT NULL,
    hash      TEXT NOT NULL,
    payload   BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS blobs (
    hash     TEXT PRIMARY KEY,
    size     INTEGER NOT NULL,
    received INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS groups (
    hash    TEXT PRIMARY KEY,
    payload BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS batches (
    id         TEXT PRIMARY KEY,
    namespace  TEXT NOT NULL,
    author     TEXT NOT NULL,
    group_hash TEXT,
    btype      TEXT NOT NULL,
    hash       TEXT NOT NULL,
    sealed     INTEGER NOT NULL,
    created    INTEGER NOT NULL,
    payload    BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS batches_open
    ON batches (namespace, author, sealed);

CREATE TABLE IF NOT EXISTS transactions (
    id        TEXT PRIMARY KEY,
    namespace TEXT NOT NULL,
    ttype     TEXT NOT NULL,
    created   INTEGER NOT NULL,
    payload   BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS operations (
    id        TEXT PRIMARY KEY,
    namespace TEXT NOT NULL,
    tx_id     TEXT NOT NULL,
    otype     TEXT NOT NULL,
    plugin    TEXT NOT NULL,
    idem_key  TEXT NOT NULL,
    status    TEXT NOT NULL,
    created   INTEGER NOT NULL,
    updated   INTEGER NOT NULL,
    payload   BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS operations_idem ON operations (namespace, idem_key);
CREATE INDEX IF NOT EXISTS operations_reconcile ON operations (status, updated);

CREATE TABLE IF NOT EXISTS pins (
    namespace   TEXT NOT NULL,
    batch_id    TEXT NOT NULL,
    context     TEXT NOT NULL,
    signer      TEXT NOT NULL,
    nonce       INTEGER NOT NULL,
    batch_index INTEGER NOT NULL,
    sequence    INTEGER,
    payload_ref TEXT,
    batch_hash  TEXT,
    state       TEXT NOT NULL,
    created     INTEGER NOT NULL,
    UNIQUE (context, signer, nonce)
);
CREATE INDEX IF NOT EXISTS pins_pump ON pins (state, sequence);
CREATE INDEX IF NOT EXISTS pins_batch ON pins (namespace, batch_id, batch_index);

CREATE TABLE IF NOT EXISTS events (
    sequence  INTEGER PRIMARY KEY,
    id        TEXT NOT NULL UNIQUE,
    namespace TEXT NOT NULL,
    etype     TEXT NOT NULL,
    reference TEXT NOT NULL,
    tx_id     TEXT,
    topic     TEXT,
    created   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions (
    id        TEXT PRIMARY KEY,
    namespace TEXT NOT NULL,
    name      TEXT NOT NULL,
    created   INTEGER NOT NULL,
    payload   BLOB NOT NULL,
    UNIQUE (namespace, name)
);

CREATE TABLE IF NOT EXISTS offsets (
    otype   TEXT NOT NULL,
    name    TEXT NOT NULL,
    current INTEGER NOT NULL,
    PRIMARY KEY (otype, name)
);

CREATE TABLE IF NOT EXISTS nonces (
    context TEXT NOT NULL,
    author  TEXT NOT NULL,
    latest  INTEGER NOT NULL,
    PRIMARY KEY (context, author)
);

CREATE TABLE IF NOT EXISTS next_pins (
    context TEXT NOT NULL,
    author  TEXT NOT NULL,
    nonce   INTEGER NOT NULL,
    PRIMARY KEY (context, author)
);
";

pub(crate) struct SqliteStore {
    connection: Connection,
    listeners: Vec<PostCommitListener>,
}

impl SqliteStore {
    pub(crate) fn open(config: StorageConfig) -> anyhow::Result<Self> {
        let connection = Connection::open(&config.sqlite_path)?;
        Self::init(connection)
    }

    pub(crate) fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(connection: Connection) -> anyhow::Result<Self> {
        connection.execute_batch(SCHEMA)?;
        Ok(Self {
            connection,
            listeners: Vec::new(),
        })
    }
}

impl Persistence for SqliteStore {
    fn with_txn(&mut self, work: TxnWork<'_>) -> StorageResult<ChangeSet> {
        let tx = self.connection.transaction()?;
        let changes = {
            let mut txn = SqliteTxn {
                tx: &tx,
                changes: ChangeSet::default(),
            };
            work(&mut txn)?;
            txn.changes
        };
        tx.commit()?;

        if !changes.is_empty() {
            for listener in &self.listeners {
                listener(&changes);
            }
        }
        Ok(changes)
    }

    fn add_post_commit_listener(&mut self, listener: PostCommitListener) {
        self.listeners.push(listener);
    }
}

struct SqliteTxn<'c> {
    tx: &'c rusqlite::Transaction<'c>,
    changes: ChangeSet,
}

impl SqliteTxn<'_> {
    fn map_message(row: &Row) -> Result<MessageRecord, rusqlite::Error> {
        let payload: Vec<u8> = row.get("payload")?;
        let state: String = row.get("state")?;
        let batch: Option<String> = row.get("batch_id")?;
        let message: Message = serde_json::from_slice(&payload).map_err(|e| {
            log::error!("Error deserializing message row: {e}");
            rusqlite::Error::InvalidQuery
        })?;
        Ok(MessageRecord {
            message,
            state: MessageState::parse(&state).map_err(|_| rusqlite::Error::InvalidQuery)?,
            batch,
        })
    }

    fn map_pin(row: &Row) -> Result<Pin, rusqlite::Error> {
        let context: String = row.get("context")?;
        let state: String = row.get("state")?;
        let nonce: i64 = row.get("nonce")?;
        let batch_index: i64 = row.get("batch_index")?;
        Ok(Pin {
            namespace: row.get("namespace")?,
            batch: row.get("batch_id")?,
            context: HashType::from_hex(&context).map_err(|_| rusqlite::Error::InvalidQuery)?,
            signer: row.get("signer")?,
            nonce: nonce as u64,
            batch_index: batch_index as u64,
            sequence: row.get("sequence")?,
            payload_ref: row.get("payload_ref")?,
            batch_hash: row
                .get::<_, Option<String>>("batch_hash")?
                .map(|s| HashType::from_hex(&s))
                .transpose()
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            state: PinState::parse(&state).map_err(|_| rusqlite::Error::InvalidQuery)?,
            created: row.get::<_, i64>("created")? as u64,
        })
    }

    fn map_event(row: &Row) -> Result<Event, rusqlite::Error> {
        let etype: String = row.get("etype")?;
        Ok(Event {
            id: row.get("id")?,
            namespace: row.get("namespace")?,
            event_type: EventType::parse(&etype).map_err(|_| rusqlite::Error::InvalidQuery)?,
            reference: row.get("reference")?,
            tx: row.get("tx_id")?,
            topic: row.get("topic")?,
            sequence: row.get("sequence")?,
            created: row.get::<_, i64>("created")? as u64,
        })
    }

    fn map_payload<T: serde::de::DeserializeOwned>(row: &Row) -> Result<T, rusqlite::Error> {
        let payload: Vec<u8> = row.get("payload")?;
        serde_json::from_slice(&payload).map_err(|e| {
            log::error!("Error deserializing row payload: {e}");
            rusqlite::Error::InvalidQuery
        })
    }
}

impl StorageTxn for SqliteTxn<'_> {
    fn upsert_message(&mut self, record: &MessageRecord) -> StorageResult<()> {
        let message = &record.message;
        let existing: Option<String> = self
            .tx
            .prepare_cached("SELECT hash FROM messages WHERE id = ?1")?
            .query_row(params![message.id], |row| row.get(0))
            .optional()?;

        match existing {
            Some(hash) if hash != message.hash.hex() => {
                return Err(StorageError::IdMismatch(message.id.clone()));
            }
            Some(_) => return Ok(()),
            None => {}
        }

        let payload = serde_json::to_vec(message)?;
        self.tx
            .prepare_cached(
                "INSERT INTO messages \
                 (id, namespace, author, group_hash, mtype, state, tag, cid, hash, batch_id, created, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?
            .execute(params![
                message.id,
                message.header.namespace,
                message.header.author,
                message.header.group.as_ref().map(HashType::hex),
                message.header.message_type.as_str(),
                record.state.as_str(),
                message.header.tag,
                message.header.cid,
                message.hash.hex(),
                record.batch,
                message.header.created as i64,
                payload,
            ])?;

        if record.state == MessageState::Staged {
            self.changes.staged_messages.push(StagedMessage {
                namespace: message.header.namespace.clone(),
                author: message.header.author.clone(),
                group: message.header.group,
                private: message.header.message_type.is_private(),
            });
        }
        Ok(())
    }

    fn get_message(&mut self, namespace: &str, id: &str) -> StorageResult<Option<MessageRecord>> {
        let record = self
            .tx
            .prepare_cached("SELECT * FROM messages WHERE namespace = ?1 AND id = ?2")?
            .query_row(params![namespace, id], Self::map_message)
            .optional()?;
        Ok(record)
    }

    fn query_messages(&mut self, query: &Query) -> StorageResult<Vec<MessageRecord>> {
        let (sql, values) = query.to_sql("SELECT * FROM messages", MESSAGE_COLUMNS)?;
        let mut stmt = self.tx.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::map_message)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn update_message_state(
        &mut self,
        namespace: &str,
        id: &str,
        state: MessageState,
        batch: Option<&EntityId>,
    ) -> StorageResult<()> {
        match batch {
            Some(batch_id) => {
                self.tx
                    .prepare_cached(
                        "UPDATE messages SET state = ?3, batch_id = ?4 \
                         WHERE namespace = ?1 AND id = ?2",
                    )?
                    .execute(params![namespace, id, state.as_str(), batch_id])?;
            }
            None => {
                self.tx
                    .prepare_cached(
                        "UPDATE messages SET state = ?3 WHERE namespace = ?1 AND id = ?2",
                    )?
                    .execute(params![namespace, id, state.as_str()])?;
            }
        }
        Ok(())
    }

    fn upsert_data(&mut self, data: &Data) -> StorageResult<()> {
        let payload = serde_json::to_vec(data)?;
        self.tx
            .prepare_cached(
                "INSERT INTO data (id, namespace, hash, payload) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (id) DO NOTHING",
            )?
            .execute(params![data.id, data.namespace, data.hash.hex(), payload])?;
        Ok(())
    }

    fn get_data(&mut self, namespace: &str, id: &str) -> StorageResult<Option<Data>> {
        let data = self
            .tx
            .prepare_cached("SELECT payload FROM data WHERE namespace = ?1 AND id = ?2")?
            .query_row(params![namespace, id], Self::map_payload::<Data>)
            .optional()?;
        Ok(data)
    }

    fn insert_blob(&mut self, hash: &HashType, size: u64) -> StorageResult<()> {
        self.tx
            .prepare_cached(
                "INSERT INTO blobs (hash, size, received) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (hash) DO NOTHING",
            )?
            .execute(params![hash.hex(), size as i64, now_millis() as i64])?;
        Ok(())
    }

    fn has_blob(&mut self, hash: &HashType) -> StorageResult<bool> {
        let found: Option<i64> = self
            .tx
            .prepare_cached("SELECT 1 FROM blobs WHERE hash = ?1")?
            .query_row(params![hash.hex()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn upsert_group(&mut self, group: &Group) -> StorageResult<()> {
        let hash = group.hash()?;
        let payload = serde_json::to_vec(group)?;
        self.tx
            .prepare_cached(
                "INSERT INTO groups (hash, payload) VALUES (?1, ?2) \
                 ON CONFLICT (hash) DO NOTHING",
            )?
            .execute(params![hash.hex(), payload])?;
        Ok(())
    }

    fn get_group(&mut self, hash: &HashType) -> StorageResult<Option<Group>> {
        let group = self
            .tx
            .prepare_cached("SELECT payload FROM groups WHERE hash = ?1")?
            .query_row(params![hash.hex()], Self::map_payload::<Group>)
            .optional()?;
        Ok(group)
    }

    fn upsert_batch(&mut self, record: &BatchRecord) -> StorageResult<()> {
        let batch = &record.batch;
        let existing: Option<(String, bool)> = self
            .tx
            .prepare_cached("SELECT hash, sealed FROM batches WHERE id = ?1")?
            .query_row(params![batch.id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        let payload = serde_json::to_vec(batch)?;
        match existing {
            Some((hash, _)) if hash != batch.hash.hex() => {
                return Err(StorageError::IdMismatch(batch.id.clone()));
            }
            Some((_, was_sealed)) => {
                self.tx
                    .prepare_cached("UPDATE batches SET sealed = ?2, payload = ?3 WHERE id = ?1")?
                    .execute(params![batch.id, record.sealed, payload])?;
                if record.sealed && !was_sealed {
                    self.changes.sealed_batches.push(batch.id.clone());
                }
            }
            None => {
                self.tx
                    .prepare_cached(
                        "INSERT INTO batches \
                         (id, namespace, author, group_hash, btype, hash, sealed, created, payload) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    )?
                    .execute(params![
                        batch.id,
                        batch.namespace,
                        batch.author,
                        batch.group.as_ref().map(HashType::hex),
                        batch.batch_type.as_str(),
                        batch.hash.hex(),
                        record.sealed,
                        batch.created as i64,
                        payload,
                    ])?;
                if record.sealed {
                    self.changes.sealed_batches.push(batch.id.clone());
                }
            }
        }
        Ok(())
    }

    fn get_batch(&mut self, namespace: &str, id: &str) -> StorageResult<Option<BatchRecord>> {
        let record = self
            .tx
            .prepare_cached("SELECT sealed, payload FROM batches WHERE namespace = ?1 AND id = ?2")?
            .query_row(params![namespace, id], |row| {
                let sealed: bool = row.get(0)?;
                let batch: Batch = Self::map_payload(row)?;
                Ok(BatchRecord { batch, sealed })
            })
            .optional()?;
        Ok(record)
    }

    fn find_open_batch(
        &mut self,
        namespace: &str,
        author: &str,
        group: Option<&HashType>,
        private: bool,
    ) -> StorageResult<Option<Batch>> {
        let btype = if private {
            BatchType::Private
        } else {
            BatchType::Broadcast
        };
        let batch = self
            .tx
            .prepare_cached(
                "SELECT payload FROM batches \
                 WHERE namespace = ?1 AND author = ?2 AND btype = ?3 AND sealed = 0 \
                 AND ((?4 IS NULL AND group_hash IS NULL) OR group_hash = ?4) \
                 ORDER BY created ASC LIMIT 1",
            )?
            .query_row(
                params![namespace, author, btype.as_str(), group.map(HashType::hex)],
                Self::map_payload::<Batch>,
            )
            .optional()?;
        Ok(batch)
    }

    fn upsert_transaction(&mut self, transaction: &Transaction) -> StorageResult<()> {
        let payload = serde_json::to_vec(transaction)?;
        self.tx
            .prepare_cached(
                "INSERT INTO transactions (id, namespace, ttype, created, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (id) DO UPDATE SET payload = excluded.payload",
            )?
            .execute(params![
                transaction.id,
                transaction.namespace,
                transaction.tx_type.as_str(),
                transaction.created as i64,
                payload,
            ])?;
        Ok(())
    }

    fn get_transaction(&mut self, namespace: &str, id: &str) -> StorageResult<Option<Transaction>> {
        let transaction = self
            .tx
            .prepare_cached("SELECT payload FROM transactions WHERE namespace = ?1 AND id = ?2")?
            .query_row(params![namespace, id], Self::map_payload::<Transaction>)
            .optional()?;
        Ok(transaction)
    }

    fn add_blockchain_id(
        &mut self,
        namespace: &str,
        tx_id: &str,
        blockchain_id: &str,
    ) -> StorageResult<()> {
        let mut transaction = self
            .get_transaction(namespace, tx_id)?
            .ok_or_else(|| anyhow::anyhow!("Transaction not found: {tx_id}"))?;
        if !transaction.blockchain_ids.iter().any(|id| id == blockchain_id) {
            transaction.blockchain_ids.push(blockchain_id.to_string());
            self.upsert_transaction(&transaction)?;
        }
        Ok(())
    }

    fn insert_operation(&mut self, op: &Operation) -> StorageResult<()> {
        let payload = serde_json::to_vec(op)?;
        self.tx
            .prepare_cached(
                "INSERT INTO operations \
                 (id, namespace, tx_id, otype, plugin, idem_key, status, created, updated, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?
            .execute(params![
                op.id,
                op.namespace,
                op.tx,
                op.op_type.as_str(),
                op.plugin,
                op.idempotency_key().map_err(StorageError::Internal)?,
                op.status.as_str(),
                op.created as i64,
                op.updated as i64,
                payload,
            ])?;
        Ok(())
    }

    fn get_operation(&mut self, namespace: &str, id: &str) -> StorageResult<Option<Operation>> {
        let op = self
            .tx
            .prepare_cached("SELECT payload FROM operations WHERE namespace = ?1 AND id = ?2")?
            .query_row(params![namespace, id], Self::map_payload::<Operation>)
            .optional()?;
        Ok(op)
    }

    fn find_succeeded_operation(
        &mut self,
        namespace: &str,
        idempotency_key: &str,
    ) -> StorageResult<Option<Operation>> {
        let op = self
            .tx
            .prepare_cached(
                "SELECT payload FROM operations \
                 WHERE namespace = ?1 AND idem_key = ?2 AND status = 'succeeded' LIMIT 1",
            )?
            .query_row(params![namespace, idempotency_key], Self::map_payload::<Operation>)
            .optional()?;
        Ok(op)
    }

    fn update_operation(&mut self, op: &Operation) -> StorageResult<()> {
        let payload = serde_json::to_vec(op)?;
        self.tx
            .prepare_cached(
                "UPDATE operations SET status = ?2, updated = ?3, payload = ?4 WHERE id = ?1",
            )?
            .execute(params![op.id, op.status.as_str(), op.updated as i64, payload])?;
        Ok(())
    }

    fn query_operations(&mut self, query: &Query) -> StorageResult<Vec<Operation>> {
        let (sql, values) = query.to_sql("SELECT payload FROM operations", OPERATION_COLUMNS)?;
        let mut stmt = self.tx.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::map_payload::<Operation>)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn upsert_pin(&mut self, pin: &Pin) -> StorageResult<()> {
        let existing: Option<(String, Option<i64>)> = self
            .tx
            .prepare_cached(
                "SELECT batch_id, sequence FROM pins \
                 WHERE context = ?1 AND signer = ?2 AND nonce = ?3",
            )?
            .query_row(
                params![pin.context.hex(), pin.signer, pin.nonce as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((batch_id, _)) if batch_id != pin.batch => {
                return Err(StorageError::IdMismatch(format!(
                    "Pin (context={}, signer={}, nonce={}) already bound to batch {batch_id}",
                    pin.context, pin.signer, pin.nonce
                )));
            }
            Some((_, current_sequence)) => {
                // Only fill in the on-chain sequence once; state never regresses here.
                if current_sequence.is_none() && pin.sequence.is_some() {
                    self.tx
                        .prepare_cached(
                            "UPDATE pins SET sequence = ?4, \
                             payload_ref = COALESCE(payload_ref, ?5), \
                             batch_hash = COALESCE(batch_hash, ?6) \
                             WHERE context = ?1 AND signer = ?2 AND nonce = ?3",
                        )?
                        .execute(params![
                            pin.context.hex(),
                            pin.signer,
                            pin.nonce as i64,
                            pin.sequence,
                            pin.payload_ref,
                            pin.batch_hash.as_ref().map(HashType::hex),
                        ])?;
                }
            }
            None => {
                self.tx
                    .prepare_cached(
                        "INSERT INTO pins \
                         (namespace, batch_id, context, signer, nonce, batch_index, sequence, payload_ref, batch_hash, state, created) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    )?
                    .execute(params![
                        pin.namespace,
                        pin.batch,
                        pin.context.hex(),
                        pin.signer,
                        pin.nonce as i64,
                        pin.batch_index as i64,
                        pin.sequence,
                        pin.payload_ref,
                        pin.batch_hash.as_ref().map(HashType::hex),
                        pin.state.as_str(),
                        pin.created as i64,
                    ])?;
            }
        }
        Ok(())
    }

    fn query_pins(&mut self, query: &Query) -> StorageResult<Vec<Pin>> {
        let (sql, values) = query.to_sql("SELECT * FROM pins", PIN_COLUMNS)?;
        let mut stmt = self.tx.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::map_pin)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn pins_for_batch(&mut self, namespace: &str, batch_id: &str) -> StorageResult<Vec<Pin>> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT * FROM pins WHERE namespace = ?1 AND batch_id = ?2 ORDER BY batch_index ASC",
        )?;
        let rows = stmt.query_map(params![namespace, batch_id], Self::map_pin)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn update_pin_state(
        &mut self,
        context: &HashType,
        signer: &str,
        nonce: u64,
        state: PinState,
    ) -> StorageResult<()> {
        self.tx
            .prepare_cached(
                "UPDATE pins SET state = ?4 WHERE context = ?1 AND signer = ?2 AND nonce = ?3",
            )?
            .execute(params![context.hex(), signer, nonce as i64, state.as_str()])?;
        Ok(())
    }

    fn lowest_waiting_pin(
        &mut self,
        namespace: &str,
        context: &HashType,
    ) -> StorageResult<Option<i64>> {
        let lowest: Option<i64> = self
            .tx
            .prepare_cached(
                "SELECT MIN(sequence) FROM pins \
                 WHERE namespace = ?1 AND context = ?2 AND state = 'waiting' \
                 AND sequence IS NOT NULL",
            )?
            .query_row(params![namespace, context.hex()], |row| row.get(0))?;
        Ok(lowest)
    }

    fn next_nonce(&mut self, context: &HashType, author: &str) -> StorageResult<u64> {
        let nonce: i64 = self
            .tx
            .prepare_cached(
                "INSERT INTO nonces (context, author, latest) VALUES (?1, ?2, 0) \
                 ON CONFLICT (context, author) DO UPDATE SET latest = latest + 1 \
                 RETURNING latest",
            )?
            .query_row(params![context.hex(), author], |row| row.get(0))?;
        Ok(nonce as u64)
    }

    fn get_next_pin(&mut self, context: &HashType, author: &str) -> StorageResult<u64> {
        let nonce: Option<i64> = self
            .tx
            .prepare_cached("SELECT nonce FROM next_pins WHERE context = ?1 AND author = ?2")?
            .query_row(params![context.hex(), author], |row| row.get(0))
            .optional()?;
        Ok(nonce.unwrap_or(0) as u64)
    }

    fn set_next_pin(&mut self, context: &HashType, author: &str, nonce: u64) -> StorageResult<()> {
        self.tx
            .prepare_cached(
                "INSERT INTO next_pins (context, author, nonce) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (context, author) DO UPDATE SET nonce = excluded.nonce",
            )?
            .execute(params![context.hex(), author, nonce as i64])?;
        Ok(())
    }

    fn insert_event(&mut self, mut event: Event) -> StorageResult<Event> {
        self.tx
            .prepare_cached(
                "INSERT INTO events (id, namespace, etype, reference, tx_id, topic, created) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?
            .execute(params![
                event.id,
                event.namespace,
                event.event_type.as_str(),
                event.reference,
                event.tx,
                event.topic,
                event.created as i64,
            ])?;
        event.sequence = self.tx.last_insert_rowid();
        self.changes.events.push(event.clone());
        Ok(event)
    }

    fn query_events(&mut self, query: &Query) -> StorageResult<Vec<Event>> {
        let (sql, values) = query.to_sql("SELECT * FROM events", EVENT_COLUMNS)?;
        let mut stmt = self.tx.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::map_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn max_event_sequence(&mut self) -> StorageResult<i64> {
        let max: i64 = self
            .tx
            .prepare_cached("SELECT COALESCE(MAX(sequence), 0) FROM events")?
            .query_row([], |row| row.get(0))?;
        Ok(max)
    }

    fn get_offset(&mut self, otype: OffsetType, name: &str) -> StorageResult<Option<i64>> {
        let current: Option<i64> = self
            .tx
            .prepare_cached("SELECT current FROM offsets WHERE otype = ?1 AND name = ?2")?
            .query_row(params![otype.as_str(), name], |row| row.get(0))
            .optional()?;
        Ok(current)
    }

    fn upsert_offset(&mut self, otype: OffsetType, name: &str, current: i64) -> StorageResult<()> {
        self.tx
            .prepare_cached(
                "INSERT INTO offsets (otype, name, current) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (otype, name) DO UPDATE SET current = excluded.current",
            )?
            .execute(params![otype.as_str(), name, current])?;
        Ok(())
    }

    fn upsert_subscription(&mut self, sub: &Subscription) -> StorageResult<()> {
        let existing: Option<String> = self
            .tx
            .prepare_cached("SELECT id FROM subscriptions WHERE namespace = ?1 AND name = ?2")?
            .query_row(params![sub.namespace, sub.name], |row| row.get(0))
            .optional()?;
        if let Some(id) = existing {
            if id != sub.id {
                return Err(StorageError::IdMismatch(sub.name.clone()));
            }
        }

        let payload = serde_json::to_vec(sub)?;
        self.tx
            .prepare_cached(
                "INSERT INTO subscriptions (id, namespace, name, created, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (id) DO UPDATE SET payload = excluded.payload",
            )?
            .execute(params![
                sub.id,
                sub.namespace,
                sub.name,
                sub.created as i64,
                payload,
            ])?;
        Ok(())
    }

    fn get_subscription(
        &mut self,
        namespace: &str,
        name: &str,
    ) -> StorageResult<Option<Subscription>> {
        let sub = self
            .tx
            .prepare_cached(
                "SELECT payload FROM subscriptions WHERE namespace = ?1 AND name = ?2",
            )?
            .query_row(params![namespace, name], Self::map_payload::<Subscription>)
            .optional()?;
        Ok(sub)
    }

    fn list_subscriptions(&mut self, namespace: &str) -> StorageResult<Vec<Subscription>> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT payload FROM subscriptions WHERE namespace = ?1 ORDER BY created ASC",
        )?;
        let rows = stmt.query_map(params![namespace], Self::map_payload::<Subscription>)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn delete_subscription(&mut self, namespace: &str, id: &str) -> StorageResult<()> {
        self.tx
            .prepare_cached("DELETE FROM subscriptions WHERE namespace = ?1 AND id = ?2")?
            .execute(params![namespace, id])?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::storage::{txn, Filter, SortDir};
    use crate::types::message::new_header;
    use crate::types::{EventType, MessageType};

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn staged_message(topic: &str) -> MessageRecord {
        let header = new_header(
            "ns1",
            "did:org/alice",
            MessageType::Broadcast,
            vec![topic.to_string()],
        );
        MessageRecord::staged(Message::new(header, vec![]).unwrap())
    }

    #[test]
    fn test_message_roundtrip() {
        let mut store = store();
        let record = staged_message("t1");
        let id = record.message.id.clone();

        store
            .with_txn(Box::new(|t| t.upsert_message(&record)))
            .unwrap();

        let loaded = txn(&mut store, |t| t.get_message("ns1", &id)).unwrap().unwrap();
        assert_eq!(loaded.message, record.message);
        assert_eq!(loaded.state, MessageState::Staged);
    }

    #[test]
    fn test_message_id_mismatch() {
        let mut store = store();
        let record = staged_message("t1");
        let mut tampered = staged_message("t2");
        tampered.message.id = record.message.id.clone();

        store
            .with_txn(Box::new(|t| t.upsert_message(&record)))
            .unwrap();
        let result = store.with_txn(Box::new(|t| t.upsert_message(&tampered)));
        assert_matches!(result, Err(StorageError::IdMismatch(_)));
    }

    #[test]
    fn test_staged_message_in_change_set() {
        let mut store = store();
        let record = staged_message("t1");
        let changes = store
            .with_txn(Box::new(|t| t.upsert_message(&record)))
            .unwrap();
        assert_eq!(changes.staged_messages.len(), 1);
        assert_eq!(changes.staged_messages[0].author, "did:org/alice");
    }

    #[test]
    fn test_rollback_on_error() {
        let mut store = store();
        let record = staged_message("t1");
        let id = record.message.id.clone();

        let result = store.with_txn(Box::new(|t| {
            t.upsert_message(&record)?;
            Err(StorageError::InvalidFilter("forced".to_string()))
        }));
        assert!(result.is_err());

        let loaded = txn(&mut store, |t| t.get_message("ns1", &id)).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_event_sequence_monotonic() {
        let mut store = store();
        let sequences = txn(&mut store, |t| {
            let mut out = Vec::new();
            for i in 0..3 {
                let event = Event::new(
                    "ns1",
                    EventType::MessageConfirmed,
                    &format!("m{i}"),
                );
                out.push(t.insert_event(event)?.sequence);
            }
            Ok(out)
        })
        .unwrap();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn test_post_commit_listener_sees_events() {
        let mut store = store();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        store.add_post_commit_listener(Box::new(move |changes| {
            seen_clone
                .lock()
                .unwrap()
                .extend(changes.events.iter().map(|e| e.sequence));
        }));

        txn(&mut store, |t| {
            t.insert_event(Event::new("ns1", EventType::MessageConfirmed, &"m1".to_string()))
        })
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_nonce_allocation_starts_at_zero() {
        let mut store = store();
        let context = HashType::new([1; 32]);
        let nonces = txn(&mut store, |t| {
            Ok(vec![
                t.next_nonce(&context, "a")?,
                t.next_nonce(&context, "a")?,
                t.next_nonce(&context, "a")?,
                t.next_nonce(&context, "b")?,
            ])
        })
        .unwrap();
        assert_eq!(nonces, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_next_pin_default_zero() {
        let mut store = store();
        let context = HashType::new([2; 32]);
        let (before, after) = txn(&mut store, |t| {
            let before = t.get_next_pin(&context, "a")?;
            t.set_next_pin(&context, "a", 5)?;
            Ok((before, t.get_next_pin(&context, "a")?))
        })
        .unwrap();
        assert_eq!(before, 0);
        assert_eq!(after, 5);
    }

    #[test]
    fn test_pin_sequence_filled_once() {
        let mut store = store();
        let context = HashType::new([3; 32]);
        let batch_id = "b1".to_string();
        let mut pin = Pin::new("ns1", &batch_id, context, "signer1", 0, 0);

        txn(&mut store, |t| t.upsert_pin(&pin)).unwrap();

        pin.sequence = Some(42);
        txn(&mut store, |t| t.upsert_pin(&pin)).unwrap();

        let pins = txn(&mut store, |t| t.pins_for_batch("ns1", "b1")).unwrap();
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].sequence, Some(42));

        // A later upsert cannot move it.
        pin.sequence = Some(99);
        txn(&mut store, |t| t.upsert_pin(&pin)).unwrap();
        let pins = txn(&mut store, |t| t.pins_for_batch("ns1", "b1")).unwrap();
        assert_eq!(pins[0].sequence, Some(42));
    }

    #[test]
    fn test_query_messages_by_state() {
        let mut store = store();
        let r1 = staged_message("t1");
        let r2 = staged_message("t2");
        store
            .with_txn(Box::new(|t| {
                t.upsert_message(&r1)?;
                t.upsert_message(&r2)?;
                t.update_message_state("ns1", &r1.message.id, MessageState::Sent, None)
            }))
            .unwrap();

        let staged = txn(&mut store, |t| {
            t.query_messages(
                &Query::new()
                    .filter(Filter::And(vec![
                        Filter::Eq("namespace", "ns1".into()),
                        Filter::Eq("state", "staged".into()),
                    ]))
                    .sort("created", SortDir::Asc),
            )
        })
        .unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].message.id, r2.message.id);
    }

    #[test]
    fn test_subscription_name_conflict() {
        let mut store = store();
        let sub1 = Subscription::new("ns1", "app1");
        let sub2 = Subscription::new("ns1", "app1");

        txn(&mut store, |t| t.upsert_subscription(&sub1)).unwrap();
        let result = txn(&mut store, |t| t.upsert_subscription(&sub2));
        assert_matches!(result, Err(StorageError::IdMismatch(_)));

        // Same id updates in place.
        let mut updated = sub1.clone();
        updated.options.read_ahead = 99;
        txn(&mut store, |t| t.upsert_subscription(&updated)).unwrap();
        let loaded = txn(&mut store, |t| t.get_subscription("ns1", "app1"))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.options.read_ahead, 99);
    }

    #[test]
    fn test_offsets() {
        let mut store = store();
        let (missing, set) = txn(&mut store, |t| {
            let missing = t.get_offset(OffsetType::Aggregator, "ns1")?;
            t.upsert_offset(OffsetType::Aggregator, "ns1", 17)?;
            Ok((missing, t.get_offset(OffsetType::Aggregator, "ns1")?))
        })
        .unwrap();
        assert_eq!(missing, None);
        assert_eq!(set, Some(17));
    }
}
