//! Authorization trees guarding verbs.

use std::sync::Arc;

use mbus_auth::{Context, PermissionEngine};

/// Boolean combination of checks evaluated before a verb runs.
/// Evaluation is asynchronous (permissions go through the engine) and
/// short-circuits.
#[derive(Clone)]
pub enum Auth {
    /// Always granted.
    Yes,
    /// Always denied.
    No,
    /// The request must carry a valid token.
    Token,
    /// The session must hold at least this level of assurance.
    Loa(u8),
    /// The named permission must be granted.
    Permission(String),
    And(Arc<Auth>, Arc<Auth>),
    Or(Arc<Auth>, Arc<Auth>),
    Not(Arc<Auth>),
}

impl Auth {
    pub fn and(self, other: Auth) -> Auth {
        Auth::And(Arc::new(self), Arc::new(other))
    }

    pub fn or(self, other: Auth) -> Auth {
        Auth::Or(Arc::new(self), Arc::new(other))
    }

    pub fn not(self) -> Auth {
        Auth::Not(Arc::new(self))
    }

    pub fn permission(text: &str) -> Auth {
        Auth::Permission(text.to_string())
    }
}

type Verdict = Box<dyn FnOnce(bool) + Send>;

/// Evaluate `auth` for `ctx`; `done` may run inline when no engine
/// round-trip is needed.
pub fn eval_auth(
    auth: &Arc<Auth>,
    ctx: &Arc<Context>,
    engine: &Arc<PermissionEngine>,
    done: Verdict,
) {
    match &**auth {
        Auth::Yes => done(true),
        Auth::No => done(false),
        Auth::Token => ctx.check_async(engine, move |status| done(status > 0)),
        Auth::Loa(required) => done(ctx.check_loa(*required)),
        Auth::Permission(text) => {
            ctx.has_permission_async(engine, text, move |status| done(status > 0));
        }
        Auth::And(first, next) => {
            let (next, ctx2, engine2) = (next.clone(), ctx.clone(), engine.clone());
            eval_auth(
                first,
                ctx,
                engine,
                Box::new(move |ok| {
                    if ok {
                        eval_auth(&next, &ctx2, &engine2, done);
                    } else {
                        done(false);
                    }
                }),
            );
        }
        Auth::Or(first, next) => {
            let (next, ctx2, engine2) = (next.clone(), ctx.clone(), engine.clone());
            eval_auth(
                first,
                ctx,
                engine,
                Box::new(move |ok| {
                    if ok {
                        done(true);
                    } else {
                        eval_auth(&next, &ctx2, &engine2, done);
                    }
                }),
            );
        }
        Auth::Not(inner) => {
            eval_auth(inner, ctx, engine, Box::new(move |ok| done(!ok)));
        }
    }
}
