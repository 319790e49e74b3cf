//! Packed request/response flag structs for the meta protocol, chosen as the
//! canonical representation over a flag-set/int-dict model.

/// `ms`'s store mode (`M<x>` flag, set-family values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Set,
    Add,
    Append,
    Prepend,
    Replace,
}

impl SetMode {
    fn token(self) -> u8 {
        match self {
            SetMode::Set => b'S',
            SetMode::Add => b'E',
            SetMode::Append => b'A',
            SetMode::Prepend => b'P',
            SetMode::Replace => b'R',
        }
    }
}

/// `ma`'s arithmetic mode (`M<x>` flag, arithmetic-family values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithMode {
    Increment,
    Decrement,
}

impl ArithMode {
    fn token(self) -> u8 {
        match self {
            ArithMode::Increment => b'I',
            ArithMode::Decrement => b'D',
        }
    }
}

/// The wire-request flags accepted by `mg/ms/md/ma`. Built with "with"-style
/// methods and treated as an immutable value from the point it's handed to
/// the executor.
#[derive(Debug, Clone, Default)]
pub struct RequestFlags {
    pub binary_key: bool,
    pub want_cas: bool,
    pub want_fetched: bool,
    pub want_client_flag: bool,
    pub want_last_access: bool,
    pub want_ttl: bool,
    pub want_value: bool,
    pub no_reply: bool,
    pub mark_stale: bool,
    pub cache_ttl: Option<i64>,
    pub recache_ttl: Option<u32>,
    pub vivify_on_miss_ttl: Option<i64>,
    pub cas_token: Option<u64>,
    pub client_flag: Option<u32>,
    pub initial_value: Option<u64>,
    pub delta: Option<u64>,
    pub set_mode: Option<SetMode>,
    pub arith_mode: Option<ArithMode>,
}

impl RequestFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// The flag set `get`/`multi_get` start from before layering on
    /// touch/recache/cas options; precomputed so the hot path isn't rebuilding
    /// a struct literal field-by-field.
    pub fn default_get() -> Self {
        RequestFlags {
            want_fetched: true,
            want_client_flag: true,
            want_last_access: true,
            want_ttl: true,
            want_value: true,
            ..Default::default()
        }
    }

    pub fn with_binary_key(mut self, binary: bool) -> Self {
        self.binary_key = binary;
        self
    }

    pub fn with_cas(mut self) -> Self {
        self.want_cas = true;
        self
    }

    pub fn with_no_reply(mut self, no_reply: bool) -> Self {
        self.no_reply = no_reply;
        self
    }

    pub fn with_mark_stale(mut self) -> Self {
        self.mark_stale = true;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: i64) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_recache_ttl(mut self, ttl: u32) -> Self {
        self.recache_ttl = Some(ttl);
        self
    }

    pub fn with_vivify_on_miss_ttl(mut self, ttl: i64) -> Self {
        self.vivify_on_miss_ttl = Some(ttl);
        self
    }

    pub fn with_cas_token(mut self, cas: u64) -> Self {
        self.cas_token = Some(cas);
        self
    }

    pub fn with_client_flag(mut self, flag: u32) -> Self {
        self.client_flag = Some(flag);
        self
    }

    pub fn with_initial_value(mut self, initial: u64) -> Self {
        self.initial_value = Some(initial);
        self
    }

    pub fn with_delta(mut self, delta: u64) -> Self {
        self.delta = Some(delta);
        self
    }

    pub fn with_set_mode(mut self, mode: SetMode) -> Self {
        self.set_mode = Some(mode);
        self
    }

    pub fn with_arith_mode(mut self, mode: ArithMode) -> Self {
        self.arith_mode = Some(mode);
        self
    }

    /// Caps `cache_ttl`/`recache_ttl`/`vivify_on_miss_ttl` to `max_ttl`,
    /// treating an existing `0` ("never expire") as `+inf` before the min, per
    /// the ephemeral/gutter routing rule.
    pub fn capped_to(&self, max_ttl: i64) -> RequestFlags {
        let cap = |ttl: i64| -> i64 {
            if ttl == 0 {
                max_ttl
            } else {
                ttl.min(max_ttl)
            }
        };
        let mut capped = self.clone();
        if let Some(ttl) = capped.cache_ttl {
            capped.cache_ttl = Some(cap(ttl));
        }
        if let Some(ttl) = capped.recache_ttl {
            capped.recache_ttl = Some(cap(ttl as i64) as u32);
        }
        if let Some(ttl) = capped.vivify_on_miss_ttl {
            capped.vivify_on_miss_ttl = Some(cap(ttl));
        }
        capped
    }

    /// Renders the space-separated flag tokens appended after the key (and
    /// size, for `ms`) on the wire.
    pub fn render_tokens(&self, op: Op) -> String {
        let mut tokens = Vec::new();
        if self.binary_key {
            tokens.push("b".to_string());
        }
        if self.want_cas {
            tokens.push("c".to_string());
        }
        if self.want_fetched {
            tokens.push("h".to_string());
        }
        if self.want_client_flag {
            tokens.push("f".to_string());
        }
        if self.want_last_access {
            tokens.push("l".to_string());
        }
        if self.want_ttl {
            tokens.push("t".to_string());
        }
        if self.want_value {
            tokens.push("v".to_string());
        }
        if self.no_reply {
            tokens.push("q".to_string());
        }
        if self.mark_stale {
            tokens.push("I".to_string());
        }
        if let Some(ttl) = self.cache_ttl {
            tokens.push(format!("T{}", ttl));
        }
        if let Some(ttl) = self.recache_ttl {
            tokens.push(format!("R{}", ttl));
        }
        if let Some(ttl) = self.vivify_on_miss_ttl {
            tokens.push(format!("N{}", ttl));
        }
        if let Some(cas) = self.cas_token {
            tokens.push(format!("C{}", cas));
        }
        if op == Op::Ms {
            if let Some(flag) = self.client_flag {
                tokens.push(format!("F{}", flag));
            }
        }
        if let Some(initial) = self.initial_value {
            tokens.push(format!("J{}", initial));
        }
        if let Some(delta) = self.delta {
            tokens.push(format!("D{}", delta));
        }
        if let Some(mode) = self.set_mode {
            tokens.push(format!("M{}", mode.token() as char));
        }
        if let Some(mode) = self.arith_mode {
            tokens.push(format!("M{}", mode.token() as char));
        }
        tokens.join(" ")
    }
}

/// One of the four commands covered by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Mg,
    Ms,
    Md,
    Ma,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Mg => "mg",
            Op::Ms => "ms",
            Op::Md => "md",
            Op::Ma => "ma",
        }
    }
}

/// Flags decoded off a response header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseFlags {
    pub cas_token: Option<u64>,
    pub client_flag: Option<u32>,
    pub ttl: Option<i64>,
    pub last_access: Option<u32>,
    pub fetched: bool,
    pub win: bool,
    pub stale: bool,
    pub opaque: Option<String>,
}

/// A single parsed meta-protocol response. `Value`'s payload may be `None`
/// when it is still owned by the framed socket's buffer and has not yet been
/// read into an owned slice.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Miss,
    Success(ResponseFlags),
    Value {
        size: u32,
        data: Option<Vec<u8>>,
        flags: ResponseFlags,
    },
    NotStored,
    Conflict(ResponseFlags),
}

impl Response {
    pub fn flags(&self) -> Option<&ResponseFlags> {
        match self {
            Response::Success(f) | Response::Value { flags: f, .. } | Response::Conflict(f) => {
                Some(f)
            }
            Response::Miss | Response::NotStored => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Response::Miss => "Miss",
            Response::Success(_) => "Success",
            Response::Value { .. } => "Value",
            Response::NotStored => "NotStored",
            Response::Conflict(_) => "Conflict",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_set_command_tokens() {
        let flags = RequestFlags::new()
            .with_cache_ttl(300)
            .with_client_flag(0);
        assert_eq!(flags.render_tokens(Op::Ms), "T300 F0");
    }

    #[test]
    fn client_flag_only_renders_for_ms() {
        let flags = RequestFlags::new().with_client_flag(7);
        assert_eq!(flags.render_tokens(Op::Mg), "");
    }

    #[test]
    fn default_get_flags_render_expected_tokens() {
        let flags = RequestFlags::default_get();
        assert_eq!(flags.render_tokens(Op::Mg), "h f l t v");
    }

    #[test]
    fn zero_ttl_caps_to_max_as_infinity() {
        let flags = RequestFlags::new().with_cache_ttl(0);
        let capped = flags.capped_to(60);
        assert_eq!(capped.cache_ttl, Some(60));
    }

    #[test]
    fn ttl_above_max_is_capped() {
        let flags = RequestFlags::new().with_cache_ttl(1000);
        let capped = flags.capped_to(60);
        assert_eq!(capped.cache_ttl, Some(60));
    }

    #[test]
    fn ttl_below_max_is_untouched() {
        let flags = RequestFlags::new().with_cache_ttl(30);
        let capped = flags.capped_to(60);
        assert_eq!(capped.cache_ttl, Some(30));
    }
}
