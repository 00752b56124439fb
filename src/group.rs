// ABOUTME: Route groups and per-type-url nodes backing the router's dispatch table
// ABOUTME: Nodes rebuild their combined chain from scratch on every registration touching them

use crate::context::ABORT_INDEX;
use crate::router::{HandlerFn, Router};

/// Index of the router's own group, which carries the global middleware.
pub(crate) const ROOT_GROUP: usize = 0;

/// Arena entry for one group: its name and middleware chain. The router
/// owns the arena; `Group` handles refer into it by index.
pub(crate) struct GroupData {
    pub(crate) name: String,
    pub(crate) handlers: Vec<HandlerFn>,
}

impl GroupData {
    pub(crate) fn new(name: &str) -> GroupData {
        GroupData {
            name: name.to_string(),
            handlers: Vec::new(),
        }
    }

    pub(crate) fn root() -> GroupData {
        GroupData::new("default")
    }
}

/// One registered type url: the groups it belongs to, its route handlers,
/// and the prebuilt combined chain used at dispatch time.
pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) full_path: String,
    pub(crate) group_ids: Vec<usize>,
    pub(crate) route_handlers: Vec<HandlerFn>,
    pub(crate) chain: Vec<HandlerFn>,
}

impl Node {
    pub(crate) fn new(name: &str, full_path: String) -> Node {
        Node {
            name: name.to_string(),
            full_path,
            group_ids: Vec::new(),
            route_handlers: Vec::new(),
            chain: Vec::new(),
        }
    }

    pub(crate) fn add_group(&mut self, id: usize) {
        if !self.group_ids.contains(&id) {
            self.group_ids.push(id);
        }
    }

    /// Rebuild the combined chain: every member group's middleware in join
    /// order, then the route handlers. Total rebuild prevents stale
    /// ordering after repeated registrations.
    pub(crate) fn rebuild(&mut self, groups: &[GroupData]) {
        self.chain.clear();
        for id in &self.group_ids {
            self.chain.extend_from_slice(&groups[*id].handlers);
        }
        self.chain.extend_from_slice(&self.route_handlers);
        if self.chain.len() >= ABORT_INDEX as usize {
            panic!("too many handlers for {:?}", self.name);
        }
    }
}

/// Mutable handle onto one group of the router.
///
/// Routes registered through a group get the group's middleware spliced
/// between the global middleware and the route handlers.
pub struct Group<'r> {
    pub(crate) router: &'r mut Router,
    pub(crate) id: usize,
}

impl Group<'_> {
    pub fn name(&self) -> &str {
        &self.router.groups[self.id].name
    }

    /// Attach middleware to this group. Affects routes registered through
    /// the group from the next registration on.
    pub fn use_middleware(&mut self, middleware: Vec<HandlerFn>) -> &mut Self {
        self.router.groups[self.id].handlers.extend(middleware);
        self
    }

    /// Register `handlers` for `name`, as a member of this group.
    pub fn handle(&mut self, name: &str, handlers: Vec<HandlerFn>) -> &mut Self {
        let id = self.id;
        self.router.register(id, name, handlers);
        self
    }
}

#[cfg(test)]
mod tests {
    use crate::handlers;
    use crate::router::Router;

    #[test]
    fn handle_creates_and_reuses_nodes() {
        let mut r = Router::new();
        r.handle("pb.Hello", handlers![|_c| {}]);

        assert_eq!(r.nodes.len(), 1);
        assert_eq!(r.nodes[0].name, "pb.Hello");

        r.handle("pb.Bye", handlers![|_c| {}]);
        assert_eq!(r.nodes.len(), 2);
        assert_eq!(r.nodes[1].name, "pb.Bye");

        // re-registering appends to the same node
        r.handle("pb.Hello", handlers![|_c| {}]);
        assert_eq!(r.nodes.len(), 2);
        assert_eq!(r.nodes[0].route_handlers.len(), 2);
    }

    #[test]
    fn global_middleware_joins_the_chain() {
        let mut r = Router::new();
        r.use_middleware(handlers![|_c| {}, |_c| {}]);
        r.handle("pb.Hello", handlers![|_c| {}]);

        assert_eq!(r.nodes.len(), 1);
        assert_eq!(r.nodes[0].chain.len(), 3);
    }

    #[test]
    fn group_middleware_sits_between_global_and_route() {
        let mut r = Router::new();
        r.use_middleware(handlers![|_c| {}, |_c| {}]);

        let mut group = r.group("test1");
        group.handle("pb.Hello", handlers![|_c| {}]);
        assert_eq!(r.nodes[0].chain.len(), 3);

        let mut group = r.group("test2");
        group.use_middleware(handlers![|_c| {}]);
        group.handle("pb.Bye", handlers![|_c| {}]);
        assert_eq!(r.nodes[1].chain.len(), 4);
    }

    #[test]
    fn group_lookup_returns_existing_group() {
        let mut r = Router::new();
        {
            let mut g = r.group("auth");
            g.use_middleware(handlers![|_c| {}]);
        }
        {
            let mut g = r.group("auth");
            g.handle("pb.Login", handlers![|_c| {}]);
        }
        // one global-less group chain: group middleware + route handler
        assert_eq!(r.nodes[0].chain.len(), 2);
        assert_eq!(r.groups.len(), 2); // root + auth
    }

    #[test]
    #[should_panic(expected = "too many handlers")]
    fn chain_length_bound_is_enforced() {
        let mut r = Router::new();
        let chain: Vec<_> = (0..63).map(|_| crate::router::HandlerFn::new(|_c| {})).collect();
        r.handle("pb.TooMany", chain);
    }
}
