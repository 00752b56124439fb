// ABOUTME: Name-based router: type urls map to middleware + handler chains
// ABOUTME: Dispatch borrows a pooled context, runs the chain, returns the context

use std::any::type_name;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::codec::Request;
use crate::context::{Context, ContextSlot, ABORT_INDEX};
use crate::group::{Group, GroupData, Node, ROOT_GROUP};
use crate::recovery::recovery;
use crate::response::ResponseWriter;
use crate::server::Handler;
use crate::util;

/// One handler in a chain: middleware or terminal, the distinction is only
/// positional. Cloning is cheap, the closure is shared.
#[derive(Clone)]
pub struct HandlerFn {
    name: &'static str,
    func: Arc<dyn Fn(&mut Context<'_>) + Send + Sync>,
}

impl HandlerFn {
    pub fn new<F>(f: F) -> HandlerFn
    where
        F: Fn(&mut Context<'_>) + Send + Sync + 'static,
    {
        HandlerFn {
            name: type_name::<F>(),
            func: Arc::new(f),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn call(&self, c: &mut Context<'_>) {
        (self.func)(c)
    }
}

impl fmt::Debug for HandlerFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerFn").field(&self.name).finish()
    }
}

/// Wrap handler closures into a chain.
///
/// ```
/// use gantry::{handlers, Context, Router};
/// let mut router = Router::new();
/// router.handle("pb.Ping", handlers![|c: &mut Context<'_>| {
///     let _ = c.write_any("pb.Pong", c.data().to_vec());
/// }]);
/// ```
#[macro_export]
macro_rules! handlers {
    ($($h:expr),+ $(,)?) => {
        vec![$($crate::router::HandlerFn::new($h)),+]
    };
}

/// One registered route, for listings.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub path: String,
    pub display_path: String,
    pub handler: &'static str,
}

/// Dispatches requests to handler chains selected by type url.
///
/// Registration happens before serving through `&mut self`; dispatch is
/// `&self` and safe to share across connections.
pub struct Router {
    pub(crate) groups: Vec<GroupData>,
    pub(crate) nodes: Vec<Node>,
    no_route: Vec<HandlerFn>,
    all_no_route: Vec<HandlerFn>,
    pool: Mutex<Vec<ContextSlot>>,
}

impl Router {
    /// A blank router without any middleware attached.
    pub fn new() -> Router {
        Router {
            groups: vec![GroupData::root()],
            nodes: Vec::new(),
            no_route: Vec::new(),
            all_no_route: Vec::new(),
            pool: Mutex::new(Vec::new()),
        }
    }

    /// A router with the recovery middleware and the default not-found
    /// handler already attached.
    pub fn default_router() -> Router {
        let mut router = Router::new();
        router.use_middleware(vec![recovery()]);
        router.no_route(handlers![default_no_route]);
        router
    }

    /// Attach global middleware, included in the chain of every route and
    /// of the not-found path. Routes already registered pick it up on
    /// their next registration.
    pub fn use_middleware(&mut self, middleware: Vec<HandlerFn>) -> &mut Self {
        self.groups[ROOT_GROUP].handlers.extend(middleware);
        self.rebuild_no_route();
        self
    }

    /// Replace the handlers run when no route matches the type url.
    pub fn no_route(&mut self, handlers: Vec<HandlerFn>) -> &mut Self {
        self.no_route = handlers;
        self.rebuild_no_route();
        self
    }

    /// Register `handlers` for `name` at the router's top level.
    pub fn handle(&mut self, name: &str, handlers: Vec<HandlerFn>) -> &mut Self {
        self.register(ROOT_GROUP, name, handlers);
        self
    }

    /// Fetch or create the group called `name`.
    pub fn group(&mut self, name: &str) -> Group<'_> {
        let id = match self.groups.iter().position(|g| g.name == name) {
            Some(id) => id,
            None => {
                self.groups.push(GroupData::new(name));
                self.groups.len() - 1
            }
        };
        Group { router: self, id }
    }

    /// All registered routes with their terminal handler names.
    pub fn routes(&self) -> Vec<RouteInfo> {
        self.nodes
            .iter()
            .map(|node| RouteInfo {
                path: node.name.clone(),
                display_path: node.full_path.clone(),
                handler: node.chain.last().map_or("", HandlerFn::name),
            })
            .collect()
    }

    pub(crate) fn register(&mut self, group_id: usize, name: &str, handlers: Vec<HandlerFn>) {
        let full_path = match util::fix_path(name) {
            Some(p) => p,
            None => panic!("invalid route name {name:?}"),
        };

        let idx = match self.nodes.iter().position(|n| n.name == name) {
            Some(idx) => idx,
            None => {
                self.nodes.push(Node::new(name, full_path));
                self.nodes.len() - 1
            }
        };

        let groups = &self.groups;
        let node = &mut self.nodes[idx];
        node.add_group(ROOT_GROUP);
        node.add_group(group_id);
        node.route_handlers.extend(handlers);
        assert!(
            !node.route_handlers.is_empty(),
            "there must be at least one handler"
        );
        node.rebuild(groups);

        tracing::debug!(
            target: "gantry::router",
            path = %node.full_path,
            handler = node.chain.last().map_or("", HandlerFn::name),
            handlers = node.chain.len(),
            "route registered"
        );
    }

    fn rebuild_no_route(&mut self) {
        let global = &self.groups[ROOT_GROUP].handlers;
        let total = global.len() + self.no_route.len();
        if total >= ABORT_INDEX as usize {
            panic!("too many handlers");
        }
        self.all_no_route.clear();
        self.all_no_route.extend_from_slice(global);
        self.all_no_route.extend_from_slice(&self.no_route);
    }

    /// Dispatch one request through its chain.
    ///
    /// A pooled context is borrowed for the duration and returned on every
    /// exit path; a panic below is re-raised after the context is back in
    /// the pool.
    pub fn serve_proto(&self, writer: &mut ResponseWriter, request: &Request) {
        let slot = self
            .pool
            .lock()
            .expect("context pool poisoned")
            .pop()
            .unwrap_or_default();

        let mut c = Context {
            router: self,
            writer,
            request,
            slot,
            index: -1,
        };
        c.reset();
        self.install_chain(&mut c, &request.type_url);

        let outcome = catch_unwind(AssertUnwindSafe(|| c.next()));

        let mut slot = c.into_slot();
        slot.reset();
        self.pool
            .lock()
            .expect("context pool poisoned")
            .push(slot);

        if let Err(payload) = outcome {
            resume_unwind(payload);
        }
    }

    /// Re-enter a context under a different type url, e.g. after a handler
    /// decided to forward the request internally. The cursor position of
    /// the calling chain is preserved.
    pub fn handle_context(&self, c: &mut Context<'_>, type_url: &str) {
        let old_index = c.index;
        c.reset();
        self.install_chain(c, type_url);
        c.next();
        c.index = old_index;
    }

    fn install_chain(&self, c: &mut Context<'_>, type_url: &str) {
        match self.nodes.iter().find(|n| n.name == type_url) {
            Some(node) => {
                c.slot.handlers.extend_from_slice(&node.chain);
                c.slot.full_path.push_str(&node.full_path);
            }
            None => {
                c.slot.handlers.extend_from_slice(&self.all_no_route);
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Router::new()
    }
}

impl Handler for Router {
    fn dispatch(&self, writer: &mut ResponseWriter, request: &Request) {
        self.serve_proto(writer, request);
    }
}

fn default_no_route(c: &mut Context<'_>) {
    if let Err(err) = c.write_error(404, "route not found") {
        tracing::error!(target: "gantry::router", error = %err, "not-found response failed");
    }
}
