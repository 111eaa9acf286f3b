//! DTT 控制台
//!
//! 用法：`dtt [template] [fixtures.json]`
//! 每行输入一组绑定：`poi=bank@0.9 method=walk`（置信度缺省为 1.0）；
//! `:status` 查看会话状态，`:restore N` 回滚到第 N 轮，`:quit` 退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use dtt::backend::MockBackend;
use dtt::concept::{ConceptValue, ProposedBinding};
use dtt::config::load_config;
use dtt::interaction::InteractionEvent;
use dtt::output::OutputAction;
use dtt::SessionHost;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dtt::observability::init();

    let mut args = std::env::args().skip(1);
    let template_id = args.next().unwrap_or_else(|| "navi".to_string());
    let fixtures = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("fixtures/navi_backend.json"));

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });
    let backend = if fixtures.exists() {
        MockBackend::from_fixtures(&fixtures).context("Failed to load backend fixtures")?
    } else {
        tracing::warn!("No fixtures at {}, backend calls will fail", fixtures.display());
        MockBackend::new()
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<(String, OutputAction)>();
    let template_dir = cfg.template_dir();
    let host = SessionHost::new(cfg, Arc::new(backend))
        .context("Invalid configuration")?
        .with_output_channel(out_tx);
    let loaded = host
        .load_templates_dir(&template_dir)
        .await
        .with_context(|| format!("Failed to load templates from {}", template_dir.display()))?;
    tracing::info!("Loaded {} template(s)", loaded);

    tokio::spawn(async move {
        while let Some((_, action)) = out_rx.recv().await {
            println!("{}", render(&action));
        }
    });

    let session = host
        .start_session(&template_id)
        .await
        .with_context(|| format!("Failed to start session for '{}'", template_id))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("stdin read failed")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let result = match line {
            ":quit" => break,
            ":status" => {
                println!("{:?}", host.session_status(&session).await?);
                continue;
            }
            _ if line.starts_with(":restore") => {
                let turn = line.trim_start_matches(":restore").trim().parse::<u64>();
                match turn {
                    Ok(turn) => host.restore_session(&session, turn).await,
                    Err(_) => {
                        eprintln!("usage: :restore <turn>");
                        continue;
                    }
                }
            }
            _ => {
                let bindings: Vec<ProposedBinding> =
                    line.split_whitespace().filter_map(parse_binding).collect();
                host.post_event(&session, InteractionEvent::utterance(bindings)).await
            }
        };
        if let Err(e) = result {
            eprintln!("error: {}", e);
            if !host.session_status(&session).await.map(|s| s.is_running()).unwrap_or(false) {
                break;
            }
        }
    }

    host.shutdown().await;
    Ok(())
}

/// `concept=value@confidence`
fn parse_binding(token: &str) -> Option<ProposedBinding> {
    let (concept, rest) = token.split_once('=')?;
    let (value, confidence) = match rest.rsplit_once('@') {
        Some((v, c)) => (v, c.parse::<f32>().ok()?),
        None => (rest, 1.0),
    };
    Some(ProposedBinding::new(concept, parse_value(value), confidence))
}

fn parse_value(text: &str) -> ConceptValue {
    match text {
        "yes" => ConceptValue::Bool(true),
        "no" => ConceptValue::Bool(false),
        _ => serde_json::from_str(text).unwrap_or_else(|_| ConceptValue::from(text)),
    }
}

fn render(action: &OutputAction) -> String {
    let fillers: Vec<String> = action
        .fillers
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    format!(
        "[{}] {:?} {} {}",
        action.turn,
        action.act,
        action.prompt,
        fillers.join(" ")
    )
}
