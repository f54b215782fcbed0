use std::borrow::Cow;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::aof::AofSender;
use crate::resp::{
    append_array_header, encode_command, resp_array, resp_bulk, resp_err, resp_int,
    resp_not_integer, resp_null, resp_null_array, resp_ok, resp_pong, resp_queued,
    resp_syntax_err, resp_wrongtype, wrong_args, Frame,
};
use crate::store::{Db, Entry, Store, Value};

type Reply = Cow<'static, [u8]>;

/// Per-connection state: transactions queue raw argument vectors here
/// between MULTI and EXEC.
pub(crate) struct ConnState {
    pub(crate) client_id: u64,
    in_txn: bool,
    queue: Vec<Vec<Vec<u8>>>,
}

impl ConnState {
    pub(crate) fn new(client_id: u64) -> Self {
        Self {
            client_id,
            in_txn: false,
            queue: Vec::new(),
        }
    }
}

fn parse_i64_arg(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

async fn log_frame(aof: Option<&AofSender>, args: &[Vec<u8>]) {
    if let Some(aof) = aof {
        aof.append(encode_command(args)).await;
    }
}

/// Route one client frame. Returns the encoded reply and whether the
/// connection should close afterwards.
pub(crate) async fn dispatch(
    frame: Frame,
    store: &Store,
    conn: &mut ConnState,
    aof: Option<&AofSender>,
) -> (Vec<u8>, bool) {
    let Some(args) = frame.into_args() else {
        return (resp_err("invalid command").into_owned(), false);
    };
    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();

    match name.as_str() {
        // MULTI always resets the queue, including when already in a
        // transaction.
        "MULTI" => {
            conn.in_txn = true;
            conn.queue.clear();
            return (resp_ok().into_owned(), false);
        }
        "DISCARD" => {
            conn.in_txn = false;
            conn.queue.clear();
            return (resp_ok().into_owned(), false);
        }
        "EXEC" => {
            if !conn.in_txn {
                return (resp_err("EXEC without MULTI").into_owned(), false);
            }
            conn.in_txn = false;
            let queued = std::mem::take(&mut conn.queue);
            // One lock for the whole batch: nothing from another
            // connection lands between consecutive queued commands.
            let mut db = store.write().await;
            let mut out = Vec::new();
            append_array_header(&mut out, queued.len());
            for queued_args in &queued {
                out.extend_from_slice(&apply(queued_args, &mut db, aof).await);
            }
            return (out, false);
        }
        _ => {}
    }

    if conn.in_txn {
        conn.queue.push(args);
        return (resp_queued().into_owned(), false);
    }

    execute(&args, store, aof).await
}

/// Run one command outside any transaction. Replay uses this directly so
/// that MULTI/EXEC frames in a log would execute rather than queue.
pub(crate) async fn execute(
    args: &[Vec<u8>],
    store: &Store,
    aof: Option<&AofSender>,
) -> (Vec<u8>, bool) {
    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    if name == "QUIT" {
        return (resp_ok().into_owned(), true);
    }
    let mut db = store.write().await;
    (apply(args, &mut db, aof).await.into_owned(), false)
}

/// Interpret one command against a locked keyspace. The caller holds the
/// write lock; the AOF append (if any) happens before it is released so
/// the log order matches commit order.
async fn apply(args: &[Vec<u8>], db: &mut Db, aof: Option<&AofSender>) -> Reply {
    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    let start = Instant::now();
    let reply = match name.as_str() {
        "PING" => cmd_ping(args),
        "QUIT" => resp_ok(),
        "SET" => cmd_set(args, db, aof).await,
        "GET" => cmd_get(args, db),
        "DEL" => cmd_del(args, db, aof).await,
        "EXISTS" => cmd_exists(args, db),
        "EXPIRE" => cmd_expire(args, db, aof).await,
        "TTL" => cmd_ttl(args, db),
        "INCR" => match args {
            [_, key] => incr_by(key, 1, args, db, aof).await,
            _ => wrong_args("incr"),
        },
        "DECR" => match args {
            [_, key] => incr_by(key, -1, args, db, aof).await,
            _ => wrong_args("decr"),
        },
        "INCRBY" => match args {
            [_, key, delta] => match parse_i64_arg(delta) {
                Some(delta) => incr_by(key, delta, args, db, aof).await,
                None => resp_not_integer(),
            },
            _ => wrong_args("incrby"),
        },
        "LPUSH" => cmd_push(args, db, aof, true).await,
        "RPUSH" => cmd_push(args, db, aof, false).await,
        "LPOP" => cmd_pop(args, db, aof, true).await,
        "RPOP" => cmd_pop(args, db, aof, false).await,
        "LRANGE" => cmd_lrange(args, db),
        "LLEN" => cmd_llen(args, db),
        "LINDEX" => cmd_lindex(args, db),
        "SADD" => cmd_sadd(args, db, aof).await,
        "SREM" => cmd_srem(args, db, aof).await,
        "SMEMBERS" => cmd_smembers(args, db),
        "SISMEMBER" => cmd_sismember(args, db),
        "SCARD" => cmd_scard(args, db),
        "SUNION" => cmd_setop(args, db, true),
        "SINTER" => cmd_setop(args, db, false),
        _ => return resp_err(&format!("unknown command '{name}'")),
    };
    metrics::histogram!("respd_command_duration_seconds", "command" => name)
        .record(start.elapsed().as_secs_f64());
    reply
}

// ── Connection commands ───────────────────────────────────────────────────────

fn cmd_ping(args: &[Vec<u8>]) -> Reply {
    match args {
        [_] => resp_pong(),
        [_, msg] => resp_bulk(msg),
        _ => wrong_args("ping"),
    }
}

// ── String commands ───────────────────────────────────────────────────────────

async fn cmd_set(args: &[Vec<u8>], db: &mut Db, aof: Option<&AofSender>) -> Reply {
    if args.len() < 3 {
        return wrong_args("set");
    }
    let key = &args[1];
    let value = args[2].clone();

    let mut ttl = None;
    let mut i = 3;
    while i < args.len() {
        let opt = String::from_utf8_lossy(&args[i]).to_ascii_uppercase();
        let Some(amount) = args.get(i + 1).and_then(|a| parse_i64_arg(a)) else {
            return resp_syntax_err();
        };
        if amount <= 0 {
            return resp_syntax_err();
        }
        ttl = match opt.as_str() {
            "EX" => Some(Duration::from_secs(amount as u64)),
            "PX" => Some(Duration::from_millis(amount as u64)),
            _ => return resp_syntax_err(),
        };
        i += 2;
    }

    debug!(key = %String::from_utf8_lossy(key), ttl = ?ttl, "SET");
    db.put(key.clone(), Entry::string(value, ttl));
    log_frame(aof, args).await;
    resp_ok()
}

fn cmd_get(args: &[Vec<u8>], db: &mut Db) -> Reply {
    if args.len() != 2 {
        return wrong_args("get");
    }
    match db.get_live(&args[1]) {
        None => resp_null(),
        Some(entry) => match entry.value.as_str() {
            Some(bytes) => resp_bulk(bytes),
            None => resp_wrongtype(),
        },
    }
}

async fn cmd_del(args: &[Vec<u8>], db: &mut Db, aof: Option<&AofSender>) -> Reply {
    if args.len() < 2 {
        return wrong_args("del");
    }
    let mut count = 0i64;
    for key in &args[1..] {
        if db.get_live(key).is_some() {
            db.remove(key);
            count += 1;
        }
    }
    debug!(removed = count, "DEL");
    if count > 0 {
        log_frame(aof, args).await;
    }
    resp_int(count)
}

fn cmd_exists(args: &[Vec<u8>], db: &mut Db) -> Reply {
    if args.len() < 2 {
        return wrong_args("exists");
    }
    // Duplicate keys in the argument list count once per mention.
    let mut count = 0i64;
    for key in &args[1..] {
        if db.get_live(key).is_some() {
            count += 1;
        }
    }
    resp_int(count)
}

async fn cmd_expire(args: &[Vec<u8>], db: &mut Db, aof: Option<&AofSender>) -> Reply {
    if args.len() != 3 {
        return wrong_args("expire");
    }
    let key = &args[1];
    let Some(seconds) = parse_i64_arg(&args[2]) else {
        return resp_not_integer();
    };
    if db.get_live(key).is_none() {
        return resp_int(0);
    }
    if seconds <= 0 {
        // A deadline in the past means the key is already gone.
        db.remove(key);
    } else if let Some(entry) = db.get_live_mut(key) {
        entry.expiry = Some(Instant::now() + Duration::from_secs(seconds as u64));
    }
    debug!(key = %String::from_utf8_lossy(key), seconds, "EXPIRE");
    log_frame(aof, args).await;
    resp_int(1)
}

fn cmd_ttl(args: &[Vec<u8>], db: &mut Db) -> Reply {
    if args.len() != 2 {
        return wrong_args("ttl");
    }
    match db.get_live(&args[1]) {
        None => resp_int(-2),
        Some(entry) => resp_int(entry.ttl_secs()),
    }
}

async fn incr_by(
    key: &[u8],
    delta: i64,
    args: &[Vec<u8>],
    db: &mut Db,
    aof: Option<&AofSender>,
) -> Reply {
    let current: i64 = match db.get_live(key) {
        None => 0,
        Some(entry) => match entry.value.as_str() {
            None => return resp_wrongtype(),
            Some(bytes) => match parse_i64_arg(bytes) {
                Some(n) => n,
                None => return resp_not_integer(),
            },
        },
    };

    let Some(next) = current.checked_add(delta) else {
        return resp_err("increment or decrement would overflow");
    };

    let text = next.to_string().into_bytes();
    match db.get_live_mut(key) {
        // In-place rewrite keeps the entry's expiry.
        Some(entry) => entry.value = Value::Str(text),
        None => db.put(key.to_vec(), Entry::string(text, None)),
    }
    log_frame(aof, args).await;
    resp_int(next)
}

// ── List commands ─────────────────────────────────────────────────────────────

async fn cmd_push(args: &[Vec<u8>], db: &mut Db, aof: Option<&AofSender>, front: bool) -> Reply {
    if args.len() < 3 {
        return wrong_args(if front { "lpush" } else { "rpush" });
    }
    let key = &args[1];
    let new_items = &args[2..];

    // get_live also reaps an expired entry, so the entry() below only ever
    // sees live state.
    if db.get_live(key).is_some_and(|e| e.value.as_list().is_none()) {
        return resp_wrongtype();
    }
    let entry = db.entries.entry(key.clone()).or_insert_with(|| Entry {
        value: Value::List(VecDeque::with_capacity(new_items.len())),
        expiry: None,
    });
    let list = match &mut entry.value {
        Value::List(l) => l,
        _ => unreachable!(),
    };

    if front {
        // Reversed so the first argument lands at index 0.
        for item in new_items.iter().rev() {
            list.push_front(item.clone());
        }
    } else {
        for item in new_items {
            list.push_back(item.clone());
        }
    }
    let len = list.len();
    metrics::gauge!("respd_keys_total").set(db.entries.len() as f64);

    log_frame(aof, args).await;
    resp_int(len as i64)
}

async fn cmd_pop(args: &[Vec<u8>], db: &mut Db, aof: Option<&AofSender>, front: bool) -> Reply {
    let cmd = if front { "lpop" } else { "rpop" };
    if args.len() < 2 || args.len() > 3 {
        return wrong_args(cmd);
    }
    let key = &args[1];
    let has_count = args.len() == 3;
    let count = if has_count {
        match parse_i64_arg(&args[2]) {
            Some(n) if n >= 0 => n as usize,
            _ => return resp_not_integer(),
        }
    } else {
        1
    };

    let (popped, remaining) = match db.get_live_mut(key) {
        None => {
            return if has_count {
                resp_null_array()
            } else {
                resp_null()
            };
        }
        Some(entry) => {
            let Some(list) = entry.value.as_list_mut() else {
                return resp_wrongtype();
            };
            let mut popped = Vec::with_capacity(count.min(list.len()));
            for _ in 0..count {
                let item = if front {
                    list.pop_front()
                } else {
                    list.pop_back()
                };
                match item {
                    Some(v) => popped.push(v),
                    None => break,
                }
            }
            let remaining: Vec<Vec<u8>> = list.iter().cloned().collect();
            (popped, remaining)
        }
    };

    if popped.is_empty() {
        // count of 0: nothing changed, nothing to log
        return resp_array(&[]);
    }

    db.drop_if_empty(key);
    debug!(
        key = %String::from_utf8_lossy(key),
        popped = popped.len(),
        remaining = remaining.len(),
        "list pop"
    );

    // The log must replay to the surviving tail without knowing pop
    // directions, so rewrite the whole list: DEL then RPUSH what is left.
    log_frame(aof, &[b"DEL".to_vec(), key.clone()]).await;
    if !remaining.is_empty() {
        let mut rpush = Vec::with_capacity(remaining.len() + 2);
        rpush.push(b"RPUSH".to_vec());
        rpush.push(key.clone());
        rpush.extend(remaining);
        log_frame(aof, &rpush).await;
    }

    if has_count {
        resp_array(&popped)
    } else {
        resp_bulk(&popped[0])
    }
}

fn cmd_lrange(args: &[Vec<u8>], db: &mut Db) -> Reply {
    if args.len() != 4 {
        return wrong_args("lrange");
    }
    let (Some(start), Some(stop)) = (parse_i64_arg(&args[2]), parse_i64_arg(&args[3])) else {
        return resp_not_integer();
    };
    let list = match db.get_live(&args[1]) {
        None => return resp_array(&[]),
        Some(entry) => match entry.value.as_list() {
            Some(list) => list,
            None => return resp_wrongtype(),
        },
    };

    let n = list.len() as i64;
    let mut start = if start < 0 { start + n } else { start };
    let mut stop = if stop < 0 { stop + n } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= n {
        stop = n - 1;
    }
    if start > stop || start >= n || stop < 0 {
        return resp_array(&[]);
    }

    let items: Vec<Vec<u8>> = list
        .iter()
        .skip(start as usize)
        .take((stop - start + 1) as usize)
        .cloned()
        .collect();
    resp_array(&items)
}

fn cmd_llen(args: &[Vec<u8>], db: &mut Db) -> Reply {
    if args.len() != 2 {
        return wrong_args("llen");
    }
    match db.get_live(&args[1]) {
        None => resp_int(0),
        Some(entry) => match entry.value.as_list() {
            Some(list) => resp_int(list.len() as i64),
            None => resp_wrongtype(),
        },
    }
}

fn cmd_lindex(args: &[Vec<u8>], db: &mut Db) -> Reply {
    if args.len() != 3 {
        return wrong_args("lindex");
    }
    let Some(index) = parse_i64_arg(&args[2]) else {
        return resp_not_integer();
    };
    let list = match db.get_live(&args[1]) {
        None => return resp_null(),
        Some(entry) => match entry.value.as_list() {
            Some(list) => list,
            None => return resp_wrongtype(),
        },
    };

    let n = list.len() as i64;
    let index = if index < 0 { index + n } else { index };
    if index < 0 || index >= n {
        return resp_null();
    }
    resp_bulk(&list[index as usize])
}

// ── Set commands ──────────────────────────────────────────────────────────────

async fn cmd_sadd(args: &[Vec<u8>], db: &mut Db, aof: Option<&AofSender>) -> Reply {
    if args.len() < 3 {
        return wrong_args("sadd");
    }
    let key = &args[1];

    if db.get_live(key).is_some_and(|e| e.value.as_set().is_none()) {
        return resp_wrongtype();
    }
    let entry = db.entries.entry(key.clone()).or_insert_with(|| Entry {
        value: Value::Set(HashSet::with_capacity(args.len() - 2)),
        expiry: None,
    });
    let set = match &mut entry.value {
        Value::Set(s) => s,
        _ => unreachable!(),
    };

    let mut added = 0i64;
    for member in &args[2..] {
        if set.insert(member.clone()) {
            added += 1;
        }
    }
    metrics::gauge!("respd_keys_total").set(db.entries.len() as f64);

    if added > 0 {
        log_frame(aof, args).await;
    }
    resp_int(added)
}

async fn cmd_srem(args: &[Vec<u8>], db: &mut Db, aof: Option<&AofSender>) -> Reply {
    if args.len() < 3 {
        return wrong_args("srem");
    }
    let key = &args[1];

    let removed = match db.get_live_mut(key) {
        None => return resp_int(0),
        Some(entry) => {
            let Some(set) = entry.value.as_set_mut() else {
                return resp_wrongtype();
            };
            let mut removed = 0i64;
            for member in &args[2..] {
                if set.remove(member.as_slice()) {
                    removed += 1;
                }
            }
            removed
        }
    };

    db.drop_if_empty(key);
    if removed > 0 {
        log_frame(aof, args).await;
    }
    resp_int(removed)
}

fn cmd_smembers(args: &[Vec<u8>], db: &mut Db) -> Reply {
    if args.len() != 2 {
        return wrong_args("smembers");
    }
    match db.get_live(&args[1]) {
        None => resp_array(&[]),
        Some(entry) => match entry.value.as_set() {
            Some(set) => {
                let members: Vec<Vec<u8>> = set.iter().cloned().collect();
                resp_array(&members)
            }
            None => resp_wrongtype(),
        },
    }
}

fn cmd_sismember(args: &[Vec<u8>], db: &mut Db) -> Reply {
    if args.len() != 3 {
        return wrong_args("sismember");
    }
    match db.get_live(&args[1]) {
        None => resp_int(0),
        Some(entry) => match entry.value.as_set() {
            Some(set) => resp_int(set.contains(args[2].as_slice()) as i64),
            None => resp_wrongtype(),
        },
    }
}

fn cmd_scard(args: &[Vec<u8>], db: &mut Db) -> Reply {
    if args.len() != 2 {
        return wrong_args("scard");
    }
    match db.get_live(&args[1]) {
        None => resp_int(0),
        Some(entry) => match entry.value.as_set() {
            Some(set) => resp_int(set.len() as i64),
            None => resp_wrongtype(),
        },
    }
}

/// SUNION / SINTER. An absent key contributes nothing to a union and
/// forces an empty intersection; a wrong-kind key is an error either way.
fn cmd_setop(args: &[Vec<u8>], db: &mut Db, union: bool) -> Reply {
    if args.len() < 2 {
        return wrong_args(if union { "sunion" } else { "sinter" });
    }

    let mut sets: Vec<Option<HashSet<Vec<u8>>>> = Vec::with_capacity(args.len() - 1);
    for key in &args[1..] {
        match db.get_live(key) {
            None => sets.push(None),
            Some(entry) => match entry.value.as_set() {
                Some(set) => sets.push(Some(set.clone())),
                None => return resp_wrongtype(),
            },
        }
    }

    let result: HashSet<Vec<u8>> = if union {
        let mut acc = HashSet::new();
        for set in sets.into_iter().flatten() {
            acc.extend(set);
        }
        acc
    } else {
        if sets.iter().any(Option::is_none) {
            return resp_array(&[]);
        }
        let mut iter = sets.into_iter().flatten();
        let mut acc = iter.next().unwrap_or_default();
        for set in iter {
            acc.retain(|m| set.contains(m));
        }
        acc
    };

    let members: Vec<Vec<u8>> = result.into_iter().collect();
    resp_array(&members)
}
