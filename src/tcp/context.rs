use std::cell::Cell;

use super::Quad;

/// Replaces the source's per-thread "current input PCB" sentinel (§5, §9) with an explicit
/// context object threaded through the input and output paths of one segment-loop
/// iteration. Each shard (here: the single-threaded `segment_loop`) owns one `InputContext`.
#[derive(Debug, Default)]
pub struct InputContext {
    current: Cell<Option<Quad>>,
}

impl InputContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `quad` as the connection currently being processed by the input path. Returns
    /// a guard that clears it on drop, so `output` calls triggered by the input handler for
    /// this connection can detect the re-entrance and skip (§4.4 preamble).
    pub fn enter(&self, quad: Quad) -> InputGuard<'_> {
        self.current.set(Some(quad));
        InputGuard { ctx: self }
    }

    pub fn is_current(&self, quad: Quad) -> bool {
        self.current.get() == Some(quad)
    }
}

pub struct InputGuard<'a> {
    ctx: &'a InputContext,
}

impl Drop for InputGuard<'_> {
    fn drop(&mut self) {
        self.ctx.current.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn quad(port: u16) -> Quad {
        Quad {
            src: super::super::Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 1),
                port,
            },
            dst: super::super::Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 2),
                port: 80,
            },
        }
    }

    #[test]
    fn guard_clears_on_drop() {
        let ctx = InputContext::new();
        let q = quad(1234);
        {
            let _guard = ctx.enter(q);
            assert!(ctx.is_current(q));
        }
        assert!(!ctx.is_current(q));
    }

    #[test]
    fn distinguishes_connections() {
        let ctx = InputContext::new();
        let a = quad(1);
        let b = quad(2);
        let _guard = ctx.enter(a);
        assert!(ctx.is_current(a));
        assert!(!ctx.is_current(b));
    }
}
