//! A small crawler driving the sender
//!
//! Seeds are queued as messages, fetched by a fixed set of worker threads
//! through an [`HttpSender`] tagged [`Initiator::Spider`], and mined for
//! links in `href`/`src` attributes and `Location` headers. Every URI seen
//! for the first time is reported to the listeners, flagged as skipped when
//! it falls outside the crawl's bounds.

use crate::http::{HttpMessage, Method};
use crate::scope::Scope;
use crate::sender::{HttpSender, Initiator, TransportContext};
use regex::Regex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use url::Url;

static LINK_ATTRIBUTE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:href|src)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
});

/// Crawl progress callbacks
///
/// Called from worker threads.
pub trait SpiderListener: Send + Sync {
    /// A URI seen for the first time; `skipped` when it will not be fetched.
    fn found_uri(&self, _msg: &HttpMessage, _skipped: bool) {}

    /// A message was fetched.
    fn read_uri(&self, _msg: &HttpMessage) {}

    /// The crawl ran out of work or was stopped.
    fn spider_complete(&self) {}
}

#[derive(Debug, Clone)]
pub struct SpiderConfig {
    pub threads: usize,
    /// Link depth below the seeds that is still fetched
    pub max_depth: usize,
    /// When set, only URIs in scope are fetched
    pub scope: Option<Scope>,
    /// Only fetch URIs on hosts of the seeds
    pub restrict_to_seed_hosts: bool,
}

impl Default for SpiderConfig {
    fn default() -> Self {
        SpiderConfig {
            threads: 2,
            max_depth: 5,
            scope: None,
            restrict_to_seed_hosts: true,
        }
    }
}

impl SpiderConfig {
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn restrict_to_seed_hosts(mut self, restrict: bool) -> Self {
        self.restrict_to_seed_hosts = restrict;
        self
    }
}

/// A node of a site tree, as built from recorded traffic
#[derive(Debug, Clone, Default)]
pub struct SiteNode {
    pub message: Option<HttpMessage>,
    pub children: Vec<SiteNode>,
}

impl SiteNode {
    pub fn new(message: Option<HttpMessage>) -> Self {
        SiteNode {
            message,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: SiteNode) -> Self {
        self.children.push(child);
        self
    }

    /// Messages in pre-order.
    fn walk<'a>(&'a self, out: &mut Vec<&'a HttpMessage>) {
        if let Some(msg) = &self.message {
            out.push(msg);
        }
        for child in &self.children {
            child.walk(out);
        }
    }
}

struct Task {
    msg: HttpMessage,
    depth: usize,
}

#[derive(Default)]
struct CrawlState {
    queue: VecDeque<Task>,
    visited: HashSet<String>,
    seed_hosts: HashSet<String>,
    in_flight: usize,
    live_workers: usize,
    started: bool,
    finished: bool,
}

fn visit_key(method: Method, url: &Url) -> String {
    format!("{} {}", method, url)
}

pub struct Spider {
    sender: HttpSender,
    config: SpiderConfig,
    listeners: RwLock<Vec<Arc<dyn SpiderListener>>>,
    state: Mutex<CrawlState>,
    work: Condvar,
    stopped: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Spider {
    pub fn new(ctx: Arc<TransportContext>, config: SpiderConfig) -> Arc<Self> {
        Arc::new(Spider {
            sender: HttpSender::new(ctx, Initiator::Spider),
            config,
            listeners: RwLock::new(Vec::new()),
            state: Mutex::new(CrawlState::default()),
            work: Condvar::new(),
            stopped: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SpiderConfig {
        &self.config
    }

    pub fn add_listener(&self, listener: Arc<dyn SpiderListener>) {
        match self.listeners.write() {
            Ok(mut guard) => guard.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn SpiderListener>> {
        match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CrawlState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a message to fetch at depth 0.
    ///
    /// Returns false when its URI was already queued or is not fetchable.
    pub fn add_seed(&self, msg: &HttpMessage) -> bool {
        let url = match msg.request().url() {
            Ok(url) => url,
            Err(e) => {
                log::warn!("Ignoring seed {}: {}", msg.request().uri(), e);
                return false;
            }
        };
        let mut state = self.lock();
        if !state.visited.insert(visit_key(msg.request().method(), &url)) {
            return false;
        }
        if let Some(host) = url.host_str() {
            state.seed_hosts.insert(host.to_ascii_lowercase());
        }
        let mut seed = msg.clone_request();
        seed.set_requesting_user(None);
        state.queue.push_back(Task {
            msg: seed,
            depth: 0,
        });
        self.work.notify_one();
        true
    }

    /// Seed from every recorded message of a site tree, in pre-order.
    ///
    /// Image responses are not seeded, but their children still are.
    pub fn seed_from_site_tree(&self, root: &SiteNode) -> usize {
        let mut messages = Vec::new();
        root.walk(&mut messages);
        messages
            .into_iter()
            .filter(|msg| !msg.response().is_some_and(|r| r.is_image()))
            .filter(|msg| self.add_seed(msg))
            .count()
    }

    /// Start the worker threads. Later calls do nothing.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        {
            let mut state = self.lock();
            if state.started {
                return Ok(());
            }
            state.started = true;
        }

        let threads = self.config.threads.max(1);
        // Counted up front so an early finisher cannot report completion
        // while the remaining workers are still being spawned
        self.lock().live_workers = threads;

        let mut workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for i in 0..threads {
            let spider = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name(format!("spider-{}", i))
                .spawn(move || spider.run_worker());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    let remaining = {
                        let mut state = self.lock();
                        state.live_workers -= threads - i;
                        state.live_workers
                    };
                    if workers.is_empty() {
                        self.lock().finished = true;
                        return Err(e);
                    }
                    log::warn!("Spider runs with {} threads: {}", workers.len(), e);
                    if remaining == 0 {
                        self.complete();
                    }
                    break;
                }
            }
        }
        log::info!("Spider started with {} threads", workers.len());
        Ok(())
    }

    /// Stop fetching and abort in-flight reads.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.sender.cancel();
        let _guard = self.lock();
        self.work.notify_all();
    }

    /// Whether the crawl was stopped or has finished
    pub fn is_stop(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) || self.lock().finished
    }

    /// Wait for every worker to exit.
    pub fn join(&self) {
        let handles: Vec<_> = match self.workers.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if handle.join().is_err() {
                log::warn!("A spider worker panicked");
            }
        }
    }

    /// URIs fetched or queued so far
    pub fn visited_count(&self) -> usize {
        self.lock().visited.len()
    }

    fn run_worker(&self) {
        while let Some(task) = self.next_task() {
            self.crawl(task);
            let mut state = self.lock();
            state.in_flight -= 1;
            self.work.notify_all();
        }

        let last = {
            let mut state = self.lock();
            state.live_workers -= 1;
            state.finished = true;
            self.work.notify_all();
            state.live_workers == 0
        };
        if last {
            self.complete();
        }
    }

    fn complete(&self) {
        log::info!("Spider complete, {} URIs seen", self.visited_count());
        for listener in self.listeners() {
            listener.spider_complete();
        }
    }

    /// Next queued task; `None` once stopped or when nothing is queued and
    /// nothing is in flight.
    fn next_task(&self) -> Option<Task> {
        let mut state = self.lock();
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(task) = state.queue.pop_front() {
                state.in_flight += 1;
                return Some(task);
            }
            if state.in_flight == 0 {
                return None;
            }
            state = match self.work.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn crawl(&self, task: Task) {
        let mut msg = task.msg;
        if let Err(e) = self.sender.send_and_receive(&mut msg, false) {
            log::debug!("Spider failed to fetch {}: {}", msg.request().uri(), e);
            return;
        }
        for listener in self.listeners() {
            listener.read_uri(&msg);
        }
        if task.depth >= self.config.max_depth {
            return;
        }

        let base = match msg.request().url() {
            Ok(base) => base,
            Err(_) => return,
        };
        for link in extract_links(&base, &msg) {
            self.found(link, task.depth + 1);
        }
    }

    fn found(&self, url: Url, depth: usize) {
        let skipped = !self.allowed(&url);
        let found = HttpMessage::get(url.as_str());
        {
            let mut state = self.lock();
            if !state.visited.insert(visit_key(Method::Get, &url)) {
                return;
            }
            let off_host = self.config.restrict_to_seed_hosts
                && !url
                    .host_str()
                    .is_some_and(|h| state.seed_hosts.contains(&h.to_ascii_lowercase()));
            if skipped || off_host {
                drop(state);
                self.notify_found(&found, true);
                return;
            }
            state.queue.push_back(Task {
                msg: found.clone(),
                depth,
            });
            self.work.notify_one();
        }
        self.notify_found(&found, false);
    }

    fn allowed(&self, url: &Url) -> bool {
        self.config
            .scope
            .as_ref()
            .map_or(true, |scope| scope.is_in_scope(url.as_str()))
    }

    fn notify_found(&self, msg: &HttpMessage, skipped: bool) {
        for listener in self.listeners() {
            listener.found_uri(msg, skipped);
        }
    }
}

impl std::fmt::Debug for Spider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spider")
            .field("config", &self.config)
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Absolute http(s) links in a fetched message, fragments removed.
fn extract_links(base: &Url, msg: &HttpMessage) -> Vec<Url> {
    let response = match msg.response() {
        Some(response) => response,
        None => return Vec::new(),
    };
    let mut raw: Vec<String> = response
        .headers()
        .get_all("Location")
        .into_iter()
        .map(str::to_string)
        .collect();

    if !response.is_image() && !response.body().is_empty() {
        match LINK_ATTRIBUTE.as_ref() {
            Ok(re) => {
                let body = response.http_body().to_string_lossy();
                for caps in re.captures_iter(&body) {
                    if let Some(m) = caps.get(1).or(caps.get(2)).or(caps.get(3)) {
                        raw.push(m.as_str().to_string());
                    }
                }
            }
            Err(e) => log::error!("Link pattern failed to compile: {}", e),
        }
    }

    let mut links = Vec::new();
    for candidate in raw {
        let candidate = candidate.trim();
        if candidate.is_empty() || candidate.starts_with('#') {
            continue;
        }
        if let Ok(mut url) = base.join(candidate) {
            url.set_fragment(None);
            if matches!(url.scheme(), "http" | "https") && !links.contains(&url) {
                links.push(url);
            }
        }
    }
    links
}
