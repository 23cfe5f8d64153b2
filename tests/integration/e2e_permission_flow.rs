//! Permission pipeline: auth trees, scripted authorities, token
//! validity, on-behalf credentials.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mbus_auth::{Context, Cred};
use mbus_core::{
    status, ApiBuilder, Auth, CallReply, ClosureReply, Request, Runtime, RuntimeBuilder,
    SessionFlags, Verb,
};
use mbus_test_utils::{drive_runtime_until, ScriptedAuthority};

fn secure_runtime(authority: Arc<ScriptedAuthority>) -> Runtime {
    let rt = RuntimeBuilder::new().authority(authority).build().unwrap();
    let api = ApiBuilder::new("secure")
        .verb(
            Verb::new("do", |req| req.reply_ok(vec![]))
                .with_auth(Auth::permission("urn:x:y")),
        )
        .verb(
            Verb::new("both", |req| req.reply_ok(vec![]))
                .with_auth(Auth::permission("urn:x:y").and(Auth::permission("urn:x:z"))),
        )
        .verb(
            Verb::new("either", |req| req.reply_ok(vec![]))
                .with_auth(Auth::permission("urn:x:y").or(Auth::permission("urn:x:z"))),
        )
        .verb(Verb::new("token-gated", |req| req.reply_ok(vec![])).with_session(SessionFlags::checked()))
        .build()
        .unwrap();
    rt.register_api(api).unwrap();
    rt
}

/// Issue a call on a fresh, non-validated session context.
fn remote_like_call(rt: &Runtime, verb: &str) -> CallReply {
    let (session, _) = rt.sessions().get(None, 60);
    let ctx = Context::new(session, None);
    let slot = Arc::new(Mutex::new(None));
    let sink = slot.clone();
    let req = Request::new(
        rt,
        "secure",
        verb,
        vec![],
        ctx,
        ClosureReply::new(move |reply| {
            *sink.lock().unwrap() = Some(reply);
        }),
    );
    rt.process(req);
    assert!(drive_runtime_until(rt, Duration::from_secs(2), || {
        slot.lock().unwrap().is_some()
    }));
    let reply = slot.lock().unwrap().take().unwrap();
    reply
}

#[test]
fn denied_then_granted_permission() {
    let authority = ScriptedAuthority::new();
    let rt = secure_runtime(authority.clone());

    let denied = remote_like_call(&rt, "do");
    assert_eq!(denied.status, status::DENIED);

    authority.set("urn:x:y", true);
    rt.perm().flush_cache();
    let granted = remote_like_call(&rt, "do");
    assert_eq!(granted.status, status::SUCCESS);
}

#[test]
fn and_requires_both_or_requires_one() {
    let authority = ScriptedAuthority::new();
    authority.set("urn:x:y", true);
    let rt = secure_runtime(authority.clone());

    assert_eq!(remote_like_call(&rt, "both").status, status::DENIED);
    assert_eq!(remote_like_call(&rt, "either").status, status::SUCCESS);

    authority.set("urn:x:z", true);
    rt.perm().flush_cache();
    assert_eq!(remote_like_call(&rt, "both").status, status::SUCCESS);
}

#[test]
fn authority_failure_reads_as_denial() {
    let authority = ScriptedAuthority::new();
    authority.set_failing("urn:x:y", -nix::libc::EIO);
    let rt = secure_runtime(authority);
    assert_eq!(remote_like_call(&rt, "do").status, status::DENIED);
}

#[test]
fn token_gated_verb_asks_the_token_permission() {
    let authority = ScriptedAuthority::new();
    let rt = secure_runtime(authority.clone());

    assert_eq!(remote_like_call(&rt, "token-gated").status, status::DENIED);
    assert!(authority
        .asked()
        .contains(&"urn:AGL:token:valid".to_string()));

    authority.set("urn:AGL:token:valid", true);
    rt.perm().flush_cache();
    assert_eq!(remote_like_call(&rt, "token-gated").status, status::SUCCESS);
}

#[test]
fn on_behalf_needs_the_partner_permission() {
    let authority = ScriptedAuthority::new();
    let rt = RuntimeBuilder::new()
        .authority(authority.clone())
        .build()
        .unwrap();

    let (session, _) = rt.sessions().get(None, 60);
    let ctx = Context::new(session, None);
    ctx.change_cred(Some(Cred::new(1, 1, 10, Some("proxy".into()))));
    let exported = Cred::new(1000, 1000, 42, Some("real-client".into())).export();

    // Refused without the permission.
    let done = Arc::new(Mutex::new(None));
    let sink = done.clone();
    ctx.on_behalf_import_async(rt.perm(), &exported, move |rc| {
        *sink.lock().unwrap() = Some(rc);
    });
    assert!(drive_runtime_until(&rt, Duration::from_secs(2), || {
        done.lock().unwrap().is_some()
    }));
    assert!(done.lock().unwrap().take().unwrap() < 0);
    assert_eq!(ctx.cred().unwrap().label(), Some("proxy"));

    // Granted with it.
    authority.set(
        "urn:AGL:permission:*:partner:on-behalf-credentials",
        true,
    );
    rt.perm().flush_cache();
    let done = Arc::new(Mutex::new(None));
    let sink = done.clone();
    ctx.on_behalf_import_async(rt.perm(), &exported, move |rc| {
        *sink.lock().unwrap() = Some(rc);
    });
    assert!(drive_runtime_until(&rt, Duration::from_secs(2), || {
        done.lock().unwrap().is_some()
    }));
    assert_eq!(done.lock().unwrap().take().unwrap(), 0);
    let cred = ctx.cred().unwrap();
    assert_eq!(cred.uid(), 1000);
    assert_eq!(cred.label(), Some("real-client"));
}
