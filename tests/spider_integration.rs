//! Crawling a loopback site

mod common;

use common::{ok, redirect, respond, TestServer};
use httpsend::scope::Scope;
use httpsend::spider::{SiteNode, Spider, SpiderConfig, SpiderListener};
use httpsend::{HttpMessage, SenderConfig, TransportContext};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Collect {
    found: Mutex<Vec<(String, bool)>>,
    read: Mutex<Vec<String>>,
    completions: Mutex<usize>,
}

impl SpiderListener for Collect {
    fn found_uri(&self, msg: &HttpMessage, skipped: bool) {
        self.found
            .lock()
            .unwrap()
            .push((msg.request().uri().to_string(), skipped));
    }

    fn read_uri(&self, msg: &HttpMessage) {
        self.read.lock().unwrap().push(msg.request().uri().to_string());
    }

    fn spider_complete(&self) {
        *self.completions.lock().unwrap() += 1;
    }
}

fn site() -> TestServer {
    TestServer::start(|seen| match seen.path() {
        "/" => ok(r#"<a href="/a">a</a> <a href="b">b</a> <a href="http://external.invalid/x">x</a>"#),
        "/a" => ok(r#"<img src="/logo.png"><a href="/">home</a><a href="/a/deep">deep</a>"#),
        "/b" => redirect("302 Found", "/c"),
        "/c" => ok("end"),
        "/logo.png" => respond("200 OK", &[("Content-Type", "image/png")], "png"),
        _ => ok("leaf"),
    })
}

fn wait_for(spider: &Spider) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !spider.is_stop() {
        assert!(Instant::now() < deadline, "crawl did not finish");
        std::thread::sleep(Duration::from_millis(20));
    }
    spider.join();
}

#[test]
fn test_crawl_follows_links_within_seed_host() {
    let server = site();
    let ctx = TransportContext::new(SenderConfig::default()).unwrap();
    let spider = Spider::new(ctx, SpiderConfig::default().threads(3));
    let collect = Arc::new(Collect::default());
    spider.add_listener(collect.clone());

    assert!(spider.add_seed(&HttpMessage::get(server.url("/"))));
    assert!(!spider.add_seed(&HttpMessage::get(server.url("/"))));
    spider.start().unwrap();
    wait_for(&spider);

    let mut paths = server.paths();
    paths.sort();
    assert_eq!(paths, vec!["/", "/a", "/a/deep", "/b", "/c", "/logo.png"]);

    let found = collect.found.lock().unwrap();
    assert!(found.contains(&("http://external.invalid/x".to_string(), true)));
    assert!(found.contains(&(server.url("/c"), false)));
    assert_eq!(collect.read.lock().unwrap().len(), 6);
    assert_eq!(*collect.completions.lock().unwrap(), 1);
}

#[test]
fn test_depth_and_scope_limits() {
    let server = site();
    let ctx = TransportContext::new(SenderConfig::default()).unwrap();
    let scope = Scope::new()
        .include(&format!("{}.*", regex::escape(&server.url("/"))))
        .unwrap()
        .exclude(".*/b$")
        .unwrap();
    let config = SpiderConfig::default().max_depth(1).scope(scope);
    let spider = Spider::new(ctx, config);
    let collect = Arc::new(Collect::default());
    spider.add_listener(collect.clone());

    spider.add_seed(&HttpMessage::get(server.url("/")));
    spider.start().unwrap();
    wait_for(&spider);

    let mut paths = server.paths();
    paths.sort();
    assert_eq!(paths, vec!["/", "/a"]);
    assert!(collect
        .found
        .lock()
        .unwrap()
        .contains(&(server.url("/b"), true)));
}

#[test]
fn test_seeding_from_site_tree_and_stop() {
    let server = site();
    let ctx = TransportContext::new(SenderConfig::default()).unwrap();
    let spider = Spider::new(ctx, SpiderConfig::default().max_depth(0));

    let mut image = HttpMessage::get(server.url("/logo.png"));
    image.set_response(
        httpsend::HttpResponse::builder()
            .header("Content-Type", "image/png")
            .build(),
    );
    let tree = SiteNode::new(Some(HttpMessage::get(server.url("/c"))))
        .with_child(SiteNode::new(Some(image)).with_child(SiteNode::new(Some(
            HttpMessage::get(server.url("/a")),
        ))));

    assert_eq!(spider.seed_from_site_tree(&tree), 2);
    spider.start().unwrap();
    wait_for(&spider);

    let mut paths = server.paths();
    paths.sort();
    assert_eq!(paths, vec!["/a", "/c"]);

    spider.stop();
    assert!(spider.is_stop());
}
