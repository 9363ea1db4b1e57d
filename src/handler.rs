//! Command parsing and the handler table.
//!
//! A line is split into a key and an optional value, the key is matched
//! against a handler table (exact match, then indexed-key match, then a
//! default handler), and the handler's result is turned into the
//! canonical reply text.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

const MAX_KEY_LEN: usize = 31;
const MAX_VAL_LEN: usize = 127;
const COMMENT_CHAR: char = '#';

/// Anything a handler can send a reply back out on. Implemented by the
/// per-connection client type in `socket`; kept as a trait here so
/// `handler` doesn't need to know about sockets at all.
pub trait Responder {
    fn send_str(&self, s: &str);
    fn send_bin(&self, data: &[u8]);
}

/// The five canonical outcomes a handler (or the parser itself) can
/// produce. Every variant but `Silence` is emitted as `<name>\n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    Ok,
    Fail,
    BadKey,
    BadVal,
    Silence,
}

impl HandlerResult {
    /// The literal line sent to the client for this result, or `None`
    /// for `Silence` (which emits nothing at all).
    pub fn reply_text(self) -> Option<&'static str> {
        match self {
            HandlerResult::Ok => Some("OK\n"),
            HandlerResult::Fail => Some("FAIL\n"),
            HandlerResult::BadKey => Some("BADKEY\n"),
            HandlerResult::BadVal => Some("BADVAL\n"),
            HandlerResult::Silence => None,
        }
    }
}

pub type HandlerFn = dyn Fn(&dyn Responder, &HandlerItem, Option<&str>) -> HandlerResult + Send + Sync;

/// The signature of the endpoint-wide "unknown key" fallback. Unlike a
/// table entry, it isn't keyed to one `key` string, so it gets the raw
/// key text instead of a `HandlerItem`.
pub type DefaultHandlerFn = dyn Fn(&dyn Responder, &str, Option<&str>) -> HandlerResult + Send + Sync;

/// What kind of key a handler answers to. An explicit tagged variant
/// in place of a float `-inf` sentinel for marking "this handler
/// accepts an indexed key".
pub enum HandlerKind {
    /// Matched only by an exact, whole-word key.
    Plain,
    /// Matched by `key`, `key[n]`, `key(n)`, `key{n}` or `keyN`; the
    /// most recently parsed index is stashed here for the handler to
    /// read back out. An atomic, not a plain `Cell`, because distinct
    /// clients may invoke the same handler concurrently and each
    /// invocation must see its own index.
    Indexed(AtomicI64),
}

/// One entry in a handler table: the key it answers to, optional help
/// text, the callback, and an opaque per-handler data cell.
pub struct HandlerItem {
    pub key: String,
    pub help: Option<String>,
    pub kind: HandlerKind,
    func: Box<HandlerFn>,
}

impl HandlerItem {
    pub fn new(
        key: impl Into<String>,
        help: Option<&str>,
        kind: HandlerKind,
        func: Box<HandlerFn>,
    ) -> HandlerItem {
        HandlerItem {
            key: key.into(),
            help: help.map(String::from),
            kind,
            func,
        }
    }

    /// The index most recently matched for an indexed handler, or `0`
    /// if this isn't one. Meant to be called from inside the handler
    /// itself, after the table has dispatched to it.
    pub fn index(&self) -> i64 {
        match &self.kind {
            HandlerKind::Indexed(cell) => cell.load(Ordering::SeqCst),
            HandlerKind::Plain => 0,
        }
    }

    fn invoke(&self, client: &dyn Responder, value: Option<&str>) -> HandlerResult {
        (self.func)(client, self, value)
    }
}

pub struct HandlerTable {
    items: Vec<HandlerItem>,
}

impl HandlerTable {
    pub fn new() -> HandlerTable {
        HandlerTable { items: Vec::new() }
    }

    pub fn register(&mut self, item: HandlerItem) -> &mut HandlerTable {
        self.items.push(item);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerItem> {
        self.items.iter()
    }

    /// Streams every handler's `key: help` pair, blank-separated at the
    /// start and end -- the response to the `help` pseudo-key.
    fn send_help(&self, client: &dyn Responder) {
        client.send_str("\nHelp:\n");
        for item in &self.items {
            if let Some(help) = &item.help {
                client.send_str(item.key.as_str());
                client.send_str(": ");
                client.send_str(help.as_str());
                client.send_str("\n");
            }
        }
        client.send_str("\n");
    }

    /// Dispatches one already-parsed command to the matching handler, or
    /// to `default` if nothing matches, or `BadKey` if there's no
    /// default either. `help` is intercepted before any handler lookup.
    pub fn dispatch(
        &self,
        client: &dyn Responder,
        key: &str,
        value: Option<&str>,
        default: Option<&DefaultHandlerFn>,
    ) -> HandlerResult {
        if key == "help" {
            self.send_help(client);
            return HandlerResult::Silence;
        }
        for item in &self.items {
            if item.key == key {
                return item.invoke(client, value);
            }
        }
        if let Some((prefix, index)) = parse_indexed_key(key) {
            for item in &self.items {
                if item.key != prefix {
                    continue;
                }
                if let HandlerKind::Indexed(cell) = &item.kind {
                    cell.store(index, Ordering::SeqCst);
                    return item.invoke(client, value);
                }
            }
        }
        if let Some(default) = default {
            return default(client, key, value);
        }
        HandlerResult::BadKey
    }
}

impl Default for HandlerTable {
    fn default() -> HandlerTable {
        HandlerTable::new()
    }
}

/// What the line-splitter found: no key at all (blank line or comment),
/// a key with no `=value`, or a key and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    NoKey,
    KeyOnly(String),
    KeyValue(String, String),
}

/// Splits a raw command line into a key and optional value: leading
/// whitespace trimmed, `#`-led lines ignored entirely, the first `=`
/// not preceded by a comment marker splits key
/// from value, the key keeps only its first whitespace-separated word
/// and is capped at 31 bytes, the value has its leading whitespace and
/// any trailing inline comment stripped, one matching pair of outer
/// quotes removed, and is capped at 127 bytes.
pub fn parse_key_value(line: &str) -> ParseOutcome {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with(COMMENT_CHAR) {
        return ParseOutcome::NoKey;
    }
    let comment_pos = trimmed.find(COMMENT_CHAR);
    let eq_pos = trimmed.find('=');
    let eq_pos = match (eq_pos, comment_pos) {
        (Some(eq), Some(c)) if c < eq => None,
        (eq, _) => eq,
    };
    match eq_pos {
        None => {
            let key = first_word(trimmed, comment_pos);
            if key.is_empty() {
                ParseOutcome::NoKey
            } else {
                ParseOutcome::KeyOnly(truncate(&key, MAX_KEY_LEN))
            }
        }
        Some(eq) => {
            let key_part = &trimmed[..eq];
            let key = first_word(key_part, None);
            if key.is_empty() {
                return ParseOutcome::NoKey;
            }
            let key = truncate(&key, MAX_KEY_LEN);
            let mut value = trimmed[eq + 1..].trim_start().to_string();
            if let Some(c) = value.find(COMMENT_CHAR) {
                value.truncate(c);
                value = value.trim_end().to_string();
            }
            strip_outer_quotes(&mut value);
            let value = truncate(&value, MAX_VAL_LEN);
            ParseOutcome::KeyValue(key, value)
        }
    }
}

fn first_word(s: &str, comment_pos: Option<usize>) -> String {
    let s = match comment_pos {
        Some(c) => &s[..c.min(s.len())],
        None => s,
    };
    s.split_whitespace().next().unwrap_or("").to_string()
}

/// Truncates `s` to at most `max` bytes, backing off to the nearest
/// preceding `char` boundary rather than slicing mid-character -- wire
/// input can contain `String::from_utf8_lossy`'s multi-byte U+FFFD
/// replacement characters, and a raw byte-index slice that lands inside
/// one of those would panic instead of disconnecting one client.
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s[..cut].to_string()
}

/// Strips the longest run of matching outer `'`/`"` pairs from `value`,
/// in place.
fn strip_outer_quotes(value: &mut String) {
    loop {
        let bytes = value.as_bytes();
        let len = bytes.len();
        if len < 2 {
            return;
        }
        let first = bytes[0];
        let last = bytes[len - 1];
        if first != last || (first != b'\'' && first != b'"') {
            return;
        }
        *value = value[1..len - 1].to_string();
    }
}

/// Peels an integer suffix off `key` in the preferred forms `key(n)`,
/// `key[n]`, `key{n}`, then the bare numeric suffix `keyN`. Returns the
/// non-numeric prefix and the parsed index, or `None` if no form
/// matches or the index falls outside `[0, INT_MAX]` (spec §4.4) --
/// parsed via `i64` first so an out-of-range value is rejected rather
/// than silently wrapping, since `i32::from_str` would also just error
/// out on overflow but we want the same "no match" fallthrough either
/// way.
fn parse_indexed_key(key: &str) -> Option<(String, i64)> {
    let in_range = |n: i64| n >= 0 && n <= i32::MAX as i64;
    for (open, close) in [('(', ')'), ('[', ']'), ('{', '}')] {
        if key.ends_with(close) {
            if let Some(open_pos) = key.rfind(open) {
                let digits = &key[open_pos + 1..key.len() - 1];
                if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(n) = digits.parse::<i64>() {
                        if in_range(n) {
                            return Some((key[..open_pos].to_string(), n));
                        }
                    }
                }
            }
        }
    }
    let digit_start = key
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i);
    if let Some(start) = digit_start {
        if start > 0 {
            let (prefix, digits) = key.split_at(start);
            if let Ok(n) = digits.parse::<i64>() {
                if in_range(n) {
                    return Some((prefix.to_string(), n));
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------
// Built-in typed accessors.
// ---------------------------------------------------------------------

fn now_secs() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub struct IntSlot {
    state: Mutex<(f64, i64)>,
}

impl IntSlot {
    pub fn new(initial: i64) -> IntSlot {
        IntSlot {
            state: Mutex::new((0.0, initial)),
        }
    }

    pub fn get(&self) -> (f64, i64) {
        *self.state.lock().unwrap()
    }

    pub fn handler(slot: std::sync::Arc<IntSlot>) -> Box<HandlerFn> {
        Box::new(move |client, item, value| match value {
            None => {
                let (_, v) = slot.get();
                client.send_str(&format!("{}={}\n", item.key, v));
                HandlerResult::Silence
            }
            Some(text) => match text.trim().parse::<i64>() {
                Ok(v) => {
                    let mut guard = slot.state.lock().unwrap();
                    *guard = (now_secs(), v);
                    HandlerResult::Ok
                }
                Err(_) => HandlerResult::BadVal,
            },
        })
    }
}

pub struct DoubleSlot {
    state: Mutex<(f64, f64)>,
}

impl DoubleSlot {
    pub fn new(initial: f64) -> DoubleSlot {
        DoubleSlot {
            state: Mutex::new((0.0, initial)),
        }
    }

    pub fn get(&self) -> (f64, f64) {
        *self.state.lock().unwrap()
    }

    pub fn handler(slot: std::sync::Arc<DoubleSlot>) -> Box<HandlerFn> {
        Box::new(move |client, item, value| match value {
            None => {
                let (_, v) = slot.get();
                client.send_str(&format!("{}={}\n", item.key, format_g(v)));
                HandlerResult::Silence
            }
            Some(text) => match text.trim().parse::<f64>() {
                Ok(v) => {
                    let mut guard = slot.state.lock().unwrap();
                    *guard = (now_secs(), v);
                    HandlerResult::Ok
                }
                Err(_) => HandlerResult::BadVal,
            },
        })
    }
}

/// A `%g`-ish rendering: shortest representation that round-trips,
/// without the `.0` Rust's `{}` leaves off integral floats, matching
/// what the C `printf("%g", ...)` the source calls for produces.
fn format_g(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e16 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

const MAX_STRING_LEN: usize = 127;

pub struct StringSlot {
    state: Mutex<(f64, String)>,
}

impl StringSlot {
    pub fn new(initial: impl Into<String>) -> StringSlot {
        StringSlot {
            state: Mutex::new((0.0, initial.into())),
        }
    }

    pub fn get(&self) -> (f64, String) {
        self.state.lock().unwrap().clone()
    }

    pub fn handler(slot: std::sync::Arc<StringSlot>) -> Box<HandlerFn> {
        Box::new(move |client, item, value| match value {
            None => {
                let (_, v) = slot.get();
                client.send_str(&format!("{}={}\n", item.key, v));
                HandlerResult::Silence
            }
            Some(text) => {
                if text.len() > MAX_STRING_LEN {
                    return HandlerResult::BadVal;
                }
                let mut guard = slot.state.lock().unwrap();
                *guard = (now_secs(), text.to_string());
                HandlerResult::Ok
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::Arc;

    struct Recorder {
        lines: RefCell<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Recorder {
            Recorder {
                lines: RefCell::new(Vec::new()),
            }
        }
    }

    impl Responder for Recorder {
        fn send_str(&self, s: &str) {
            self.lines.borrow_mut().push(s.to_string());
        }
        fn send_bin(&self, data: &[u8]) {
            self.lines
                .borrow_mut()
                .push(String::from_utf8_lossy(data).into_owned());
        }
    }

    #[test]
    fn parses_key_only() {
        assert_eq!(
            parse_key_value("int"),
            ParseOutcome::KeyOnly("int".to_string())
        );
    }

    #[test]
    fn parses_key_value_with_inline_comment() {
        assert_eq!(
            parse_key_value("int = 7 # set it"),
            ParseOutcome::KeyValue("int".to_string(), "7".to_string())
        );
    }

    #[test]
    fn comment_only_line_is_no_key() {
        assert_eq!(parse_key_value("   # full comment"), ParseOutcome::NoKey);
    }

    #[test]
    fn key_token_keeps_only_first_word() {
        assert_eq!(
            parse_key_value("int extra=5"),
            ParseOutcome::KeyOnly("int".to_string())
        );
    }

    #[test]
    fn value_quotes_are_stripped() {
        assert_eq!(
            parse_key_value("name=\"bob smith\""),
            ParseOutcome::KeyValue("name".to_string(), "bob smith".to_string())
        );
    }

    #[test]
    fn int_set_then_get_round_trips() {
        let slot = Arc::new(IntSlot::new(0));
        let item = HandlerItem::new("int", None, HandlerKind::Plain, IntSlot::handler(slot.clone()));
        let client = Recorder::new();
        assert_eq!(item.invoke(&client, Some("7")), HandlerResult::Ok);
        assert_eq!(item.invoke(&client, None), HandlerResult::Silence);
        assert_eq!(client.lines.borrow().last().unwrap(), "int=7\n");
    }

    #[test]
    fn int_handler_rejects_garbage() {
        let slot = Arc::new(IntSlot::new(0));
        let item = HandlerItem::new("int", None, HandlerKind::Plain, IntSlot::handler(slot));
        let client = Recorder::new();
        assert_eq!(item.invoke(&client, Some("notanumber")), HandlerResult::BadVal);
    }

    #[test]
    fn indexed_key_forms_all_present_the_same_index() {
        for form in ["flags[3]", "flags(3)", "flags{3}", "flags3"] {
            let (prefix, idx) = parse_indexed_key(form).unwrap();
            assert_eq!(prefix, "flags");
            assert_eq!(idx, 3);
        }
    }

    #[test]
    fn indexed_key_beyond_int_max_does_not_match() {
        assert_eq!(parse_indexed_key("flags[3000000000]"), None);
        assert_eq!(parse_indexed_key("flags9999999999"), None);
        assert_eq!(
            parse_indexed_key("flags[2147483647]"),
            Some(("flags".to_string(), 2147483647))
        );
    }

    #[test]
    fn truncate_backs_off_to_a_char_boundary_instead_of_panicking() {
        // 43 copies of the 3-byte replacement char U+FFFD, as
        // `String::from_utf8_lossy` would produce from invalid wire
        // bytes; a raw `s[..127]` would land mid-character and panic.
        let value: String = std::iter::repeat('\u{FFFD}').take(43).collect();
        assert_eq!(value.len(), 129);
        let truncated = truncate(&value, MAX_VAL_LEN);
        assert!(truncated.len() <= MAX_VAL_LEN);
        assert!(value.starts_with(&truncated));
    }

    #[test]
    fn table_dispatches_indexed_handler_and_records_index() {
        let mut table = HandlerTable::new();
        table.register(HandlerItem::new(
            "flags",
            None,
            HandlerKind::Indexed(AtomicI64::new(0)),
            Box::new(|client, item, value| {
                let n = item.index();
                match value {
                    None => {
                        client.send_str(&format!("flags = bit {}\n", n));
                        HandlerResult::Silence
                    }
                    Some(_) => {
                        client.send_str(&format!("flags[{}] = 1\n", n));
                        HandlerResult::Silence
                    }
                }
            }),
        ));
        let client = Recorder::new();
        table.dispatch(&client, "flags[3]", Some("1"), None);
        assert_eq!(client.lines.borrow()[0], "flags[3] = 1\n");
        table.dispatch(&client, "flags(5)", Some("1"), None);
        assert_eq!(client.lines.borrow()[1], "flags[5] = 1\n");
    }

    #[test]
    fn unknown_key_without_default_is_bad_key() {
        let table = HandlerTable::new();
        let client = Recorder::new();
        assert_eq!(
            table.dispatch(&client, "nope", None, None),
            HandlerResult::BadKey
        );
    }

    #[test]
    fn help_lists_registered_handlers() {
        let mut table = HandlerTable::new();
        table.register(HandlerItem::new(
            "int",
            Some("set/get integer flag"),
            HandlerKind::Plain,
            Box::new(|_, _, _| HandlerResult::Silence),
        ));
        let client = Recorder::new();
        table.dispatch(&client, "help", None, None);
        let lines = client.lines.borrow();
        assert_eq!(lines[0], "\nHelp:\n");
        assert!(lines.iter().any(|l| l == "int"));
        assert!(lines.iter().any(|l| l == "set/get integer flag"));
    }
}
