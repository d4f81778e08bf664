//! The cache orchestrator.
//!
//! [`Cache::call`] is the externally visible cached invocation: it decides,
//! per call, whether memoized work can be reused or the function body must
//! run, and keeps the tables up to date either way. The decision procedure,
//! in order: cascade on a changed function digest, bind the arguments,
//! look up a prior call, re-check every file that call read (with the
//! mtime-debounce rule), verify produced files still exist, then either
//! replay the stored outcome or execute and record.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tracing::debug;

use anvil_common::{BuildError, Digest, Value};

use crate::bind::{bind, BoundArgs, FuncSpec};
use crate::error::CacheError;
use crate::snapshot;
use crate::tables::{CallOutcome, FileRecord, FileStamp, FunctionRecord, TableStats, Tables};

/// Tuning knobs for the cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a file's mtime must have been stable before the cached
    /// digest is trusted without re-reading the content.
    ///
    /// Filesystem timestamps have coarse granularity: a file rewritten
    /// within the same timestamp tick keeps its mtime, so any mtime younger
    /// than this window forces a content re-hash. Default: 1 second, which
    /// covers common filesystem timestamp resolution.
    pub mtime_debounce: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mtime_debounce: Duration::from_secs(1),
        }
    }
}

/// Context handle threaded into every cacheable function body.
///
/// Carries the accumulator for files discovered mid-execution (e.g. headers
/// found by scanning a source file). There is no ambient "current call"
/// state: a function that wants to register dependencies receives the
/// context explicitly.
pub struct CallContext {
    extra_sources: Mutex<Vec<PathBuf>>,
    extra_dests: Mutex<Vec<PathBuf>>,
}

impl CallContext {
    fn new() -> Self {
        Self {
            extra_sources: Mutex::new(Vec::new()),
            extra_dests: Mutex::new(Vec::new()),
        }
    }

    /// Adds files discovered while the call is executing, without making
    /// them parameters: `srcs` join the call's tracked inputs, `dsts` its
    /// tracked outputs.
    pub fn add_dependencies(&self, srcs: &[PathBuf], dsts: &[PathBuf]) {
        self.extra_sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(srcs);
        self.extra_dests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(dsts);
    }

    fn into_parts(self) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let sources = self
            .extra_sources
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let dests = self
            .extra_dests
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        (sources, dests)
    }
}

/// A build-step function that has opted into caching.
///
/// The [`FuncSpec`] declares the signature, identity digest, and file role
/// per parameter; `invoke` runs the actual work. Implementations must be
/// deterministic with respect to their bound arguments and tracked files.
/// A returned [`BuildError`] is an expected, cacheable failure; a panic is
/// a programming error and is never cached.
pub trait BuildFn: Send + Sync {
    /// The declared signature and identity of this function.
    fn spec(&self) -> &FuncSpec;

    /// Executes the function body.
    fn invoke(&self, ctx: &CallContext, args: &BoundArgs) -> Result<Value, BuildError>;
}

/// Wraps a closure as a [`BuildFn`] — the way a plain function opts into
/// caching without any runtime registration machinery.
pub struct Cached<F> {
    spec: FuncSpec,
    body: F,
}

impl<F> Cached<F>
where
    F: Fn(&CallContext, &BoundArgs) -> Result<Value, BuildError> + Send + Sync,
{
    /// Pairs a declared signature with the closure implementing it.
    pub fn new(spec: FuncSpec, body: F) -> Self {
        Self { spec, body }
    }
}

impl<F> BuildFn for Cached<F>
where
    F: Fn(&CallContext, &BoundArgs) -> Result<Value, BuildError> + Send + Sync,
{
    fn spec(&self) -> &FuncSpec {
        &self.spec
    }

    fn invoke(&self, ctx: &CallContext, args: &BoundArgs) -> Result<Value, BuildError> {
        (self.body)(ctx, args)
    }
}

/// The persistent call-level cache.
///
/// One explicit handle, constructed at process start (usually via
/// [`Cache::load_or_create`]), shared by reference with every collaborator,
/// and saved explicitly at shutdown. Distinct functions evaluate fully
/// concurrently; calls to the same function serialize on a per-function
/// lock, so concurrent identical calls collapse to a single execution.
pub struct Cache {
    config: CacheConfig,
    tables: Mutex<Tables>,
    /// Per-function evaluation locks. The map itself is guarded separately,
    /// so acquiring one function's lock never blocks another function.
    func_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Cache {
    /// An empty cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            tables: Mutex::new(Tables::default()),
            func_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Loads a snapshot from `path`, or starts empty if it is missing,
    /// corrupt, or from an incompatible format version. Fail-safe: a bad
    /// snapshot is a cold cache, never an error.
    pub fn load_or_create(path: &Path, config: CacheConfig) -> Self {
        let tables = snapshot::load(path).unwrap_or_default();
        Self {
            config,
            tables: Mutex::new(tables),
            func_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Invokes `func` through the cache with positional arguments only.
    pub fn call(&self, func: &dyn BuildFn, args: &[Value]) -> Result<Value, CacheError> {
        self.call_with_kwargs(func, args, &BTreeMap::new())
    }

    /// Invokes `func` through the cache.
    ///
    /// Returns the memoized result when the function digest, bound
    /// arguments, and every tracked file are unchanged and all produced
    /// files still exist; otherwise executes the body and records the
    /// outcome. A cached [`BuildError`] is re-raised identically without
    /// re-invoking the body.
    pub fn call_with_kwargs(
        &self,
        func: &dyn BuildFn,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<Value, CacheError> {
        let spec = func.spec();

        // Calls to the same function serialize here; a second caller with
        // identical arguments finds the first caller's record below.
        let func_lock = self.func_lock(&spec.name);
        let _serialized = func_lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.refresh_function_digest(spec);

        let bound = bind(spec, args, kwargs).map_err(|source| CacheError::Bind {
            function: spec.name.clone(),
            source,
        })?;

        if let Some(outcome) = self.try_reuse(spec, &bound) {
            return match outcome {
                CallOutcome::Ok(value) => Ok(value),
                CallOutcome::Failed(err) => Err(CacheError::Build(err)),
            };
        }

        self.execute_and_record(func, spec, bound)
    }

    /// Removes a function and all of its call records and file edges.
    /// Returns whether anything was actually removed.
    pub fn clear_function(&self, name: &str) -> bool {
        self.lock_tables().remove_function(name)
    }

    /// Forgets a file and every call that read it. Returns whether anything
    /// was actually removed.
    pub fn clear_file(&self, path: &Path) -> bool {
        self.lock_tables().clear_file(path)
    }

    /// Discards everything — the next run rebuilds from scratch.
    pub fn clear(&self) {
        *self.lock_tables() = Tables::default();
    }

    /// Writes the whole cache to `path` atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        snapshot::save(&self.lock_tables(), path)
    }

    /// A JSON rendering of all tables, for inspection tooling.
    pub fn dump(&self) -> serde_json::Value {
        serde_json::to_value(&*self.lock_tables()).unwrap_or(serde_json::Value::Null)
    }

    /// Counts of live records.
    pub fn stats(&self) -> TableStats {
        self.lock_tables().stats()
    }

    /// Step 1: if the function's digest changed since last seen, discard
    /// all of its call records and edges, then adopt the new digest.
    fn refresh_function_digest(&self, spec: &FuncSpec) {
        let mut tables = self.lock_tables();
        let seen = tables.functions.get(&spec.name).map(|r| r.digest);
        match seen {
            Some(previous) if previous != spec.digest => {
                debug!(
                    function = %spec.name,
                    "function digest changed; discarding its call records"
                );
                tables.invalidate_function(&spec.name);
                if let Some(record) = tables.functions.get_mut(&spec.name) {
                    record.digest = spec.digest;
                }
            }
            Some(_) => {}
            None => {
                tables
                    .functions
                    .insert(spec.name.clone(), FunctionRecord::new(spec.digest));
            }
        }
    }

    /// Steps 3-5: returns the stored outcome if the prior call with these
    /// bound arguments is still valid, `None` if the call is dirty.
    fn try_reuse(&self, spec: &FuncSpec, bound: &BoundArgs) -> Option<CallOutcome> {
        let (call_id, dests, outcome, edges) = {
            let tables = self.lock_tables();
            let call = tables.find_call(&spec.name, bound)?;
            let call_id = call.call_id;
            let dests = call.dests.clone();
            let outcome = call.outcome.clone();
            let edges = tables.edges_for(&spec.name, call_id).cloned()?;
            (call_id, dests, outcome, edges)
        };

        // File checks run without the tables lock; the per-function lock
        // already serializes calls to this function.
        for (path, old_stamp) in &edges {
            // A vanished or unreadable input reads as absent.
            let current = match self.check_file(path) {
                Ok(digest) => FileStamp::Present(digest),
                Err(_) => FileStamp::Absent,
            };
            if current != *old_stamp {
                debug!(function = %spec.name, file = %path.display(), "input file changed");
                return None;
            }
        }

        for dest in &dests {
            if !dest.exists() {
                debug!(function = %spec.name, file = %dest.display(), "output file missing");
                return None;
            }
        }

        debug!(function = %spec.name, call_id, "replaying cached outcome");
        Some(outcome)
    }

    /// Steps 7-8: run the function body and record the outcome, the file
    /// edges (declared plus externally registered), and the file records.
    fn execute_and_record(
        &self,
        func: &dyn BuildFn,
        spec: &FuncSpec,
        bound: BoundArgs,
    ) -> Result<Value, CacheError> {
        debug!(function = %spec.name, "executing function body");
        let ctx = CallContext::new();
        let invoked = func.invoke(&ctx, &bound);
        let (extra_sources, extra_dests) = ctx.into_parts();

        let mut sources = declared_paths(spec, &bound, PathKind::Source);
        sources.extend(extra_sources);

        // Output existence is only meaningful for successful results; a
        // failed call records no dests so its error replays cleanly.
        let dests = match &invoked {
            Ok(value) => {
                let mut dests = declared_paths(spec, &bound, PathKind::Dest);
                dests.extend(extra_dests);
                if spec.ret.is_dest() {
                    dests.extend(value.paths());
                }
                dests
            }
            Err(_) => Vec::new(),
        };

        let outcome = match &invoked {
            Ok(value) => CallOutcome::Ok(value.clone()),
            Err(err) => CallOutcome::Failed(err.clone()),
        };

        let mut files = BTreeMap::new();
        for path in sources {
            // A missing source gets an explicit absent edge, so creating
            // the file later dirties the call (and its cached error).
            let stamp = match self.check_file(&path) {
                Ok(digest) => FileStamp::Present(digest),
                Err(e) if e.kind() == io::ErrorKind::NotFound => FileStamp::Absent,
                Err(source) => return Err(CacheError::Io { path, source }),
            };
            files.insert(path, stamp);
        }
        for path in &dests {
            let _ = self.check_file(path);
        }

        self.lock_tables()
            .record_call(&spec.name, spec.digest, bound, outcome, dests, files);

        invoked.map_err(CacheError::Build)
    }

    /// Returns the file's current digest, re-reading content only when the
    /// mtime moved or is too fresh to trust (the debounce rule).
    ///
    /// The tables lock is held only to read and update the file record,
    /// never across the stat or the content hash, so one function hashing a
    /// large file does not stall the rest of the cache.
    fn check_file(&self, path: &Path) -> io::Result<Digest> {
        let meta = std::fs::metadata(path)?;
        let mtime_ns = system_time_ns(meta.modified()?);
        let now_ns = system_time_ns(SystemTime::now());
        let debounce_ns = self.config.mtime_debounce.as_nanos();

        let known = self.lock_tables().files.get(path).copied();
        if let Some(record) = known {
            if record.mtime_ns == mtime_ns && now_ns.saturating_sub(mtime_ns) >= debounce_ns {
                return Ok(record.digest);
            }
        }

        let digest = Digest::from_file(path)?;
        self.lock_tables()
            .files
            .insert(path.to_path_buf(), FileRecord { mtime_ns, digest });
        Ok(digest)
    }

    fn func_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.func_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// The tables are only ever mutated in complete units, so a lock
    /// poisoned by a panicking function body still guards consistent data.
    fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PathKind {
    Source,
    Dest,
}

/// Collects the file paths named by declared source (or dest) parameters.
fn declared_paths(spec: &FuncSpec, bound: &BoundArgs, kind: PathKind) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for param in &spec.params {
        let wanted = match kind {
            PathKind::Source => param.role.is_source(),
            PathKind::Dest => param.role.is_dest(),
        };
        if wanted {
            if let Some(value) = bound.get(&param.name) {
                out.extend(value.paths());
            }
        }
    }
    out
}

fn system_time_ns(t: SystemTime) -> u128 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::{ParamSpec, Role};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn digest(data: &[u8]) -> Digest {
        Digest::from_bytes(data)
    }

    /// `f(x) = x * 2`, counting executions.
    fn doubler(
        counter: Arc<AtomicUsize>,
    ) -> Cached<impl Fn(&CallContext, &BoundArgs) -> Result<Value, BuildError> + Send + Sync> {
        let spec = FuncSpec::new("double", digest(b"double v1"))
            .param(ParamSpec::new("x", Role::Plain));
        Cached::new(spec, move |_ctx, args| {
            counter.fetch_add(1, Ordering::SeqCst);
            let x = args.get("x").and_then(Value::as_int).unwrap_or(0);
            Ok(Value::Int(x * 2))
        })
    }

    #[test]
    fn idempotent_for_unchanged_inputs() {
        let cache = Cache::new(CacheConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let f = doubler(runs.clone());

        assert_eq!(cache.call(&f, &[Value::Int(3)]).unwrap(), Value::Int(6));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert_eq!(cache.call(&f, &[Value::Int(3)]).unwrap(), Value::Int(6));
        assert_eq!(runs.load(Ordering::SeqCst), 1, "second call must replay");

        assert_eq!(cache.call(&f, &[Value::Int(4)]).unwrap(), Value::Int(8));
        assert_eq!(runs.load(Ordering::SeqCst), 2, "new arguments must execute");
    }

    #[test]
    fn keyword_spelling_hits_same_record() {
        let cache = Cache::new(CacheConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let f = doubler(runs.clone());

        cache.call(&f, &[Value::Int(3)]).unwrap();

        let mut kw = BTreeMap::new();
        kw.insert("x".to_string(), Value::Int(3));
        assert_eq!(
            cache.call_with_kwargs(&f, &[], &kw).unwrap(),
            Value::Int(6)
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn build_errors_replay_without_reexecution() {
        let cache = Cache::new(CacheConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();

        let spec = FuncSpec::new("always_fails", digest(b"v1"));
        let f = Cached::new(spec, move |_ctx, _args| {
            runs_in.fetch_add(1, Ordering::SeqCst);
            Err(BuildError::Other("link failed".to_string()))
        });

        let first = cache.call(&f, &[]).unwrap_err();
        let second = cache.call(&f, &[]).unwrap_err();
        assert_eq!(runs.load(Ordering::SeqCst), 1, "error must replay from cache");
        assert_eq!(first.to_string(), second.to_string());
        assert!(matches!(second, CacheError::Build(BuildError::Other(_))));
    }

    #[test]
    fn panics_are_not_cached() {
        let cache = Arc::new(Cache::new(CacheConfig::default()));
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();

        let spec = FuncSpec::new("flaky", digest(b"v1"));
        let f = Arc::new(Cached::new(spec, move |_ctx, _args| {
            if runs_in.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first run exploded");
            }
            Ok(Value::Unit)
        }));

        let cache_in = cache.clone();
        let f_in = f.clone();
        let result = std::thread::spawn(move || cache_in.call(&*f_in, &[])).join();
        assert!(result.is_err(), "panic must propagate");

        // Nothing was recorded, so the next call executes again.
        assert!(cache.call(&*f, &[]).is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    fn source_reader(
        name: &str,
        counter: Arc<AtomicUsize>,
    ) -> Cached<impl Fn(&CallContext, &BoundArgs) -> Result<Value, BuildError> + Send + Sync> {
        let spec = FuncSpec::new(name, digest(name.as_bytes()))
            .param(ParamSpec::new("source", Role::Source));
        Cached::new(spec, move |_ctx, args| {
            counter.fetch_add(1, Ordering::SeqCst);
            let path = match args.get("source") {
                Some(Value::Path(p)) => p.clone(),
                other => return Err(BuildError::Other(format!("bad source arg: {other:?}"))),
            };
            let text = std::fs::read_to_string(&path)
                .map_err(|e| BuildError::Other(format!("read {}: {e}", path.display())))?;
            Ok(Value::Int(text.len() as i64))
        })
    }

    #[test]
    fn changed_source_content_busts_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("main.c");
        fs::write(&src, "int main() {}").unwrap();

        let cache = Cache::new(CacheConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let f = source_reader("compile", runs.clone());
        let arg = Value::Path(src.clone());

        cache.call(&f, &[arg.clone()]).unwrap();
        cache.call(&f, &[arg.clone()]).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        fs::write(&src, "int main() { return 1; }").unwrap();
        cache.call(&f, &[arg]).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2, "content change must re-execute");
    }

    #[test]
    fn fresh_mtime_always_rehashes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("main.c");
        fs::write(&src, "aaaa").unwrap();
        let mtime = fs::metadata(&src).unwrap().modified().unwrap();

        // A huge debounce keeps every mtime inside the "too fresh" window,
        // so the test cannot race the wall clock.
        let cache = Cache::new(CacheConfig {
            mtime_debounce: Duration::from_secs(3600),
        });
        let runs = Arc::new(AtomicUsize::new(0));
        let f = source_reader("compile", runs.clone());
        let arg = Value::Path(src.clone());

        cache.call(&f, &[arg.clone()]).unwrap();

        // Rewrite with different content but pin the mtime back: within the
        // debounce window the digest is recomputed, so the change is seen.
        fs::write(&src, "bbbb").unwrap();
        fs::File::options()
            .write(true)
            .open(&src)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        cache.call(&f, &[arg]).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn settled_mtime_skips_rehash() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("main.c");
        fs::write(&src, "aaaa").unwrap();
        let old = SystemTime::now() - Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(&src)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let cache = Cache::new(CacheConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let f = source_reader("compile", runs.clone());
        let arg = Value::Path(src.clone());

        cache.call(&f, &[arg.clone()]).unwrap();

        // Same mtime, outside the debounce window: digest is trusted, so a
        // same-length rewrite with the pinned mtime is (by design) not seen.
        fs::write(&src, "cccc").unwrap();
        fs::File::options()
            .write(true)
            .open(&src)
            .unwrap()
            .set_modified(old)
            .unwrap();

        cache.call(&f, &[arg]).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn created_source_file_busts_cached_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("config.h");

        let cache = Cache::new(CacheConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let f = source_reader("compile", runs.clone());
        let arg = Value::Path(src.clone());

        // The missing source is an expected build failure, cached with an
        // absent edge for the path.
        assert!(cache.call(&f, &[arg.clone()]).is_err());
        assert!(cache.call(&f, &[arg.clone()]).is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 1, "missing-file error must replay");

        fs::write(&src, "#define N 1").unwrap();
        assert!(cache.call(&f, &[arg]).is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 2, "created source must re-execute");
    }

    #[test]
    fn unreadable_declared_source_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("srcdir");
        fs::create_dir(&src).unwrap();

        let cache = Cache::new(CacheConfig::default());
        let spec =
            FuncSpec::new("scan", digest(b"v1")).param(ParamSpec::new("source", Role::Source));
        let f = Cached::new(spec, |_ctx, _args| Ok(Value::Unit));

        // A directory stats fine but cannot be content-hashed.
        let err = cache.call(&f, &[Value::Path(src)]).unwrap_err();
        assert!(matches!(err, CacheError::Io { .. }));
        assert_eq!(cache.stats().calls, 0, "nothing recorded");
    }

    #[test]
    fn distinct_functions_evaluate_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.c");
        let b = dir.path().join("b.c");
        fs::write(&a, "aaa").unwrap();
        fs::write(&b, "bbb").unwrap();

        let cache = Arc::new(Cache::new(CacheConfig::default()));
        let rendezvous = Arc::new(std::sync::Barrier::new(2));

        let make = |name: &str, gate: Arc<std::sync::Barrier>| {
            let spec = FuncSpec::new(name, digest(name.as_bytes()))
                .param(ParamSpec::new("source", Role::Source));
            Cached::new(spec, move |_ctx, args: &BoundArgs| {
                // Both bodies must be in flight at once for either to pass.
                gate.wait();
                let path = match args.get("source") {
                    Some(Value::Path(p)) => p.clone(),
                    other => return Err(BuildError::Other(format!("bad source arg: {other:?}"))),
                };
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| BuildError::Other(e.to_string()))?;
                Ok(Value::Int(text.len() as i64))
            })
        };

        let f_a = Arc::new(make("compile_a", rendezvous.clone()));
        let f_b = Arc::new(make("compile_b", rendezvous));

        let cache_a = cache.clone();
        let ta = {
            let arg = Value::Path(a);
            std::thread::spawn(move || cache_a.call(&*f_a, &[arg]).unwrap())
        };
        let tb = {
            let arg = Value::Path(b);
            std::thread::spawn(move || cache.call(&*f_b, &[arg]).unwrap())
        };

        assert_eq!(ta.join().unwrap(), Value::Int(3));
        assert_eq!(tb.join().unwrap(), Value::Int(3));
    }

    #[test]
    fn changed_digest_invalidates_all_prior_calls() {
        let cache = Cache::new(CacheConfig::default());
        let runs_v1 = Arc::new(AtomicUsize::new(0));
        let runs_v1_in = runs_v1.clone();

        let spec_v1 = FuncSpec::new("double", digest(b"v1"))
            .param(ParamSpec::new("x", Role::Plain));
        let v1 = Cached::new(spec_v1, move |_ctx, args| {
            runs_v1_in.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int(args.get("x").and_then(Value::as_int).unwrap_or(0) * 2))
        });

        cache.call(&v1, &[Value::Int(3)]).unwrap();
        cache.call(&v1, &[Value::Int(4)]).unwrap();

        // An unrelated function's cache must survive the cascade below.
        let other_runs = Arc::new(AtomicUsize::new(0));
        let other_runs_in = other_runs.clone();
        let other = Cached::new(
            FuncSpec::new("other", digest(b"other v1")).param(ParamSpec::new("x", Role::Plain)),
            move |_ctx, _args| {
                other_runs_in.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Unit)
            },
        );
        cache.call(&other, &[Value::Int(1)]).unwrap();

        let runs_v2 = Arc::new(AtomicUsize::new(0));
        let runs_v2_in = runs_v2.clone();
        let spec_v2 = FuncSpec::new("double", digest(b"v2"))
            .param(ParamSpec::new("x", Role::Plain));
        let v2 = Cached::new(spec_v2, move |_ctx, args| {
            runs_v2_in.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int(args.get("x").and_then(Value::as_int).unwrap_or(0) * 2))
        });

        cache.call(&v2, &[Value::Int(3)]).unwrap();
        cache.call(&v2, &[Value::Int(4)]).unwrap();
        assert_eq!(runs_v2.load(Ordering::SeqCst), 2, "both argument sets re-execute");

        cache.call(&other, &[Value::Int(1)]).unwrap();
        assert_eq!(other_runs.load(Ordering::SeqCst), 1, "other function untouched");
    }

    #[test]
    fn missing_output_forces_reexecution() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a.o");

        let cache = Cache::new(CacheConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        let out_in = out.clone();

        let spec = FuncSpec::new("emit", digest(b"v1")).returns(Role::Dest);
        let f = Cached::new(spec, move |_ctx, _args| {
            runs_in.fetch_add(1, Ordering::SeqCst);
            std::fs::write(&out_in, b"object code")
                .map_err(|e| BuildError::Other(e.to_string()))?;
            Ok(Value::Path(out_in.clone()))
        });

        cache.call(&f, &[]).unwrap();
        cache.call(&f, &[]).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        fs::remove_file(&out).unwrap();
        cache.call(&f, &[]).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2, "deleted output must rebuild");
    }

    #[test]
    fn externally_registered_dependency_busts_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let header = dir.path().join("config.h");
        fs::write(&header, "#define N 1").unwrap();

        let cache = Cache::new(CacheConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        let header_in = header.clone();

        let spec = FuncSpec::new("scan", digest(b"v1"));
        let f = Cached::new(spec, move |ctx, _args| {
            runs_in.fetch_add(1, Ordering::SeqCst);
            // Discovered while scanning, not a declared parameter.
            ctx.add_dependencies(&[header_in.clone()], &[]);
            Ok(Value::Unit)
        });

        cache.call(&f, &[]).unwrap();
        cache.call(&f, &[]).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        fs::write(&header, "#define N 2").unwrap();
        cache.call(&f, &[]).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clear_function_forces_reexecution() {
        let cache = Cache::new(CacheConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let f = doubler(runs.clone());

        cache.call(&f, &[Value::Int(3)]).unwrap();
        assert!(cache.clear_function("double"));
        assert!(!cache.clear_function("double"), "second clear removes nothing");

        cache.call(&f, &[Value::Int(3)]).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clear_file_affects_only_dependent_calls() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.c");
        let b = dir.path().join("b.c");
        fs::write(&a, "aaa").unwrap();
        fs::write(&b, "bbb").unwrap();

        let cache = Cache::new(CacheConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let f = source_reader("compile", runs.clone());

        cache.call(&f, &[Value::Path(a.clone())]).unwrap();
        cache.call(&f, &[Value::Path(b.clone())]).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        assert!(cache.clear_file(&a));

        cache.call(&f, &[Value::Path(a)]).unwrap();
        cache.call(&f, &[Value::Path(b)]).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3, "only a.c's call re-executes");
    }

    #[test]
    fn concurrent_identical_calls_collapse_to_one_execution() {
        let cache = Arc::new(Cache::new(CacheConfig::default()));
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();

        let spec = FuncSpec::new("slow", digest(b"v1"));
        let f = Arc::new(Cached::new(spec, move |_ctx, _args| {
            runs_in.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            Ok(Value::Int(7))
        }));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let f = f.clone();
                std::thread::spawn(move || cache.call(&*f, &[]).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Value::Int(7));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bind_failure_is_reported_and_never_cached() {
        let cache = Cache::new(CacheConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let f = doubler(runs.clone());

        let mut kw = BTreeMap::new();
        kw.insert("y".to_string(), Value::Int(1));
        let err = cache.call_with_kwargs(&f, &[], &kw).unwrap_err();
        assert!(matches!(err, CacheError::Bind { .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dump_and_stats_reflect_recorded_calls() {
        let cache = Cache::new(CacheConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let f = doubler(runs.clone());

        cache.call(&f, &[Value::Int(3)]).unwrap();
        cache.call(&f, &[Value::Int(4)]).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.functions, 1);
        assert_eq!(stats.calls, 2);

        let dump = cache.dump();
        assert!(dump["functions"]["double"]["calls"].is_array());
    }
}
