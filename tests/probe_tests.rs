mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use cred_scan_rs::config::{ScriptConfig, ServiceConfig, ServiceTable};
use cred_scan_rs::error::ProbeError;
use cred_scan_rs::inventory::{HostRecord, InventoryData, JsonInventory};
use cred_scan_rs::probe::{
    format_nmap_args, multiply_script_args, CommandBuilder, FormExtra, HostProbe, Invocation, NmapHostProbe,
    ProbeSettings,
};
use cred_scan_rs::dictionary::save_extras;
use cred_scan_rs::probe::ScanExtras;
use cred_scan_rs::store::ResultStore;
use cred_scan_rs::types::{HostId, TriState};
use tokio_util::sync::CancellationToken;

const IP: &str = "192.168.196.105";

fn http_scripts() -> Vec<ScriptConfig> {
    vec![
        ScriptConfig::new("http-brute").with_script_args("unpwdb.timelimit=60m"),
        ScriptConfig::new("http-form-brute").with_script_args("unpwdb.timelimit=60m"),
    ]
}

fn telnet_scripts() -> Vec<ScriptConfig> {
    vec![ScriptConfig::new("telnet-brute").with_other_args("-v")]
}

fn dns_scripts() -> Vec<ScriptConfig> {
    vec![ScriptConfig::new("telnet-brute")]
}

fn forms() -> Vec<FormExtra> {
    vec![
        FormExtra::default(),
        FormExtra {
            path: Some("/oauth".into()),
            passvar: Some("token".into()),
            uservar: Some("username".into()),
            ..Default::default()
        },
        FormExtra {
            uservar: Some("name".into()),
            ..Default::default()
        },
    ]
}

fn lines(invocations: &[Invocation]) -> Vec<String> {
    invocations.iter().map(|i| i.command_line(IP)).collect()
}

fn touch(dir: &Path, names: &[&str]) {
    for name in names {
        std::fs::write(dir.join(name), "x\n").unwrap();
    }
}

#[test]
fn nmap_args_with_and_without_script_args() {
    let cmd = vec!["--script test-brute".to_string()];
    let script_args = vec![
        "unpwdb.timelimit=90m,brute.firstonly=true".to_string(),
        "userdb=".to_string(),
        "passdb=".to_string(),
    ];
    assert_eq!(
        format_nmap_args("192.168.196.1", 22, &cmd, &script_args).join(" "),
        "-n -p 22 --script test-brute --script-args unpwdb.timelimit=90m,brute.firstonly=true,userdb=,passdb= 192.168.196.1 -oX -"
    );
    assert_eq!(
        format_nmap_args("192.168.196.1", 22, &cmd, &[]),
        vec!["-n", "-p", "22", "--script", "test-brute", "192.168.196.1", "-oX", "-"]
    );
}

#[test]
fn script_args_multiply_per_form() {
    let base = vec!["unpwdb.timelimit=90m,brute.firstonly=true".to_string()];
    let forms = vec![
        FormExtra {
            path: Some("/auth".into()),
            method: Some("GET".into()),
            uservar: Some("user".into()),
            passvar: Some("pass".into()),
        },
        FormExtra {
            path: Some("/login".into()),
            ..Default::default()
        },
        FormExtra {
            uservar: Some("user".into()),
            passvar: Some("pass".into()),
            ..Default::default()
        },
    ];
    assert_eq!(
        multiply_script_args(&base, &forms),
        vec![
            vec![
                "unpwdb.timelimit=90m,brute.firstonly=true",
                "http-form-brute.path=/auth",
                "http-form-brute.method=GET",
                "http-form-brute.uservar=user",
                "http-form-brute.passvar=pass",
            ],
            vec!["unpwdb.timelimit=90m,brute.firstonly=true", "http-form-brute.path=/login"],
            vec![
                "unpwdb.timelimit=90m,brute.firstonly=true",
                "http-form-brute.uservar=user",
                "http-form-brute.passvar=pass",
            ],
        ]
    );
}

#[test]
fn default_invocations_use_builtin_wordlists() {
    let builder = CommandBuilder::new("/var/lib/cred-scan/dict", "/opt/scripts");
    assert_eq!(
        lines(&builder.default_invocations(80, &http_scripts(), None)),
        vec![
            "-n -p 80 --script http-brute --script-args unpwdb.timelimit=60m 192.168.196.105 -oX -",
            "-n -p 80 --script http-form-brute --script-args unpwdb.timelimit=60m 192.168.196.105 -oX -",
        ]
    );
    assert_eq!(
        lines(&builder.default_invocations(23, &telnet_scripts(), None)),
        vec!["-n -p 23 --script telnet-brute -v 192.168.196.105 -oX -"]
    );

    let strict = builder.strict_http(true);
    assert_eq!(
        lines(&strict.default_invocations(80, &http_scripts(), None)),
        vec![
            "-n -p 80 --script /opt/scripts/http-brute.nse --script-args unpwdb.timelimit=60m 192.168.196.105 -oX -",
            "-n -p 80 --script http-form-brute --script-args unpwdb.timelimit=60m 192.168.196.105 -oX -",
        ]
    );
}

#[tokio::test]
async fn credfile_invocations_need_generated_file() {
    let dict = tempfile::tempdir().unwrap();
    touch(dict.path(), &["http_creds.lst", "telnet_creds.lst"]);
    let d = dict.path().display();
    let builder = CommandBuilder::new(dict.path(), "/opt/scripts");
    let forms = forms();

    assert_eq!(
        lines(&builder.credfile_invocations(80, "HTTP", &http_scripts(), Some(&forms)).await),
        vec![
            format!("-n -p 80 --script http-brute --script-args unpwdb.timelimit=60m,brute.mode=creds,brute.credfile={d}/http_creds.lst {IP} -oX -"),
            format!("-n -p 80 --script http-form-brute --script-args unpwdb.timelimit=60m,brute.mode=creds,brute.credfile={d}/http_creds.lst {IP} -oX -"),
            format!("-n -p 80 --script http-form-brute --script-args unpwdb.timelimit=60m,brute.mode=creds,brute.credfile={d}/http_creds.lst,http-form-brute.path=/oauth,http-form-brute.uservar=username,http-form-brute.passvar=token {IP} -oX -"),
            format!("-n -p 80 --script http-form-brute --script-args unpwdb.timelimit=60m,brute.mode=creds,brute.credfile={d}/http_creds.lst,http-form-brute.uservar=name {IP} -oX -"),
        ]
    );
    assert_eq!(
        builder.credfile_invocations(80, "HTTP", &http_scripts(), None).await.len(),
        2
    );
    assert_eq!(
        lines(&builder.credfile_invocations(23, "TELNET", &telnet_scripts(), None).await),
        vec![format!(
            "-n -p 23 --script telnet-brute -v --script-args brute.mode=creds,brute.credfile={d}/telnet_creds.lst {IP} -oX -"
        )]
    );
    assert!(builder
        .credfile_invocations(53, "DNS", &dns_scripts(), None)
        .await
        .is_empty());
}

#[tokio::test]
async fn userpass_invocations_pair_user_and_password_lists() {
    let dict = tempfile::tempdir().unwrap();
    touch(
        dict.path(),
        &["http_users.lst", "http_pwds.lst", "telnet_users.lst", "telnet_pwds.lst", "ftp_pwds.lst"],
    );
    let d = dict.path().display();
    let builder = CommandBuilder::new(dict.path(), "/opt/scripts");
    let forms = forms();

    assert_eq!(
        lines(&builder.userpass_invocations(80, "HTTP", &http_scripts(), Some(&forms)).await),
        vec![
            format!("-n -p 80 --script http-brute --script-args unpwdb.timelimit=60m,userdb={d}/http_users.lst,passdb={d}/http_pwds.lst {IP} -oX -"),
            format!("-n -p 80 --script http-form-brute --script-args unpwdb.timelimit=60m,userdb={d}/http_users.lst,passdb={d}/http_pwds.lst {IP} -oX -"),
            format!("-n -p 80 --script http-form-brute --script-args unpwdb.timelimit=60m,userdb={d}/http_users.lst,passdb={d}/http_pwds.lst,http-form-brute.path=/oauth,http-form-brute.uservar=username,http-form-brute.passvar=token {IP} -oX -"),
            format!("-n -p 80 --script http-form-brute --script-args unpwdb.timelimit=60m,userdb={d}/http_users.lst,passdb={d}/http_pwds.lst,http-form-brute.uservar=name {IP} -oX -"),
        ]
    );
    assert_eq!(
        lines(&builder.userpass_invocations(23, "TELNET", &telnet_scripts(), None).await),
        vec![format!(
            "-n -p 23 --script telnet-brute -v --script-args userdb={d}/telnet_users.lst,passdb={d}/telnet_pwds.lst {IP} -oX -"
        )]
    );
    assert_eq!(
        lines(
            &builder
                .userpass_invocations(21, "FTP", &[ScriptConfig::new("ftp-brute")], None)
                .await
        ),
        vec![format!("-n -p 21 --script ftp-brute --script-args passdb={d}/ftp_pwds.lst {IP} -oX -")]
    );
    assert!(builder
        .userpass_invocations(53, "DNS", &dns_scripts(), None)
        .await
        .is_empty());
}

#[tokio::test]
async fn non_brute_scripts_only_run_with_defaults() {
    let dict = tempfile::tempdir().unwrap();
    touch(dict.path(), &["redis_creds.lst", "redis_users.lst"]);
    let builder = CommandBuilder::new(dict.path(), "/opt/scripts");
    let service = ServiceConfig {
        service_name: "REDIS".into(),
        protocol: "tcp".into(),
        port: 6379,
        scripts: vec![ScriptConfig::new("redis-info"), ScriptConfig::new("redis-brute")],
    };
    let names: Vec<String> = builder
        .invocations(&service, None)
        .await
        .into_iter()
        .map(|i| i.script_name)
        .collect();
    assert_eq!(names, vec!["redis-info", "redis-brute", "redis-brute", "redis-brute"]);
}

// --- host probe ---

fn service(name: &str, port: u16, scripts: &[&str]) -> (String, ServiceConfig) {
    (
        format!("tcp_{port}"),
        ServiceConfig {
            service_name: name.into(),
            protocol: "tcp".into(),
            port,
            scripts: scripts.iter().map(|s| ScriptConfig::new(s)).collect(),
        },
    )
}

fn addressed_inventory(addresses: &[&str]) -> Arc<JsonInventory> {
    Arc::new(JsonInventory::new(InventoryData {
        hosts: vec![HostRecord {
            addresses: addresses.iter().map(|a| a.parse().unwrap()).collect(),
            ..host("aa:bb:cc:dd:ee:05", None, &[], TriState::On)
        }],
        ..Default::default()
    }))
}

fn probe_with(
    runner: Arc<FakeRunner>,
    dict: &Path,
    services: ServiceTable,
    skip_verify: bool,
    addresses: &[&str],
) -> NmapHostProbe {
    probe_on_store(runner, dict, services, skip_verify, addresses, memory_store())
}

fn probe_on_store(
    runner: Arc<FakeRunner>,
    dict: &Path,
    services: ServiceTable,
    skip_verify: bool,
    addresses: &[&str],
    store: ResultStore,
) -> NmapHostProbe {
    NmapHostProbe::new(
        runner,
        addressed_inventory(addresses),
        store,
        CommandBuilder::new(dict, "/opt/scripts"),
        services,
        ProbeSettings {
            probe_timeout: Duration::from_secs(30),
            recheck_timeout: Duration::from_secs(5),
            skip_verify,
        },
    )
}

fn target() -> HostId {
    HostId::new("AA:BB:CC:DD:EE:05")
}

/// Credential file named in a recheck's `--script-args`, if any.
fn credfile(args: &[String]) -> Option<String> {
    args.iter()
        .find_map(|a| a.strip_prefix("brute.mode=creds,brute.credfile="))
        .and_then(|rest| rest.split(',').next())
        .map(String::from)
}

/// Script name following `--script`.
fn script_of(args: &[String]) -> String {
    let pos = args.iter().position(|a| a == "--script").unwrap();
    args[pos + 1].clone()
}

#[tokio::test]
async fn recheck_discards_unconfirmed_credentials() {
    let dict = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|args| match credfile(args) {
        Some(path) => {
            let line = std::fs::read_to_string(path).unwrap();
            let (user, pass) = line.trim_end().split_once('/').unwrap();
            let confirmed: &[(&str, &str)] = if (user, pass) == ("admin", "123456") {
                &[("admin", "123456")]
            } else {
                &[]
            };
            Ok(accounts_xml("ssh-brute", confirmed))
        }
        None => Ok(accounts_xml("ssh-brute", &[("admin", "123456"), ("guest", "guest")])),
    });
    let probe = probe_with(
        runner.clone(),
        dict.path(),
        ServiceTable::from([service("SSH", 22, &["ssh-brute"])]),
        false,
        &["10.0.0.5/32"],
    );

    let findings = probe.scan(&target(), CancellationToken::new()).await;
    assert_eq!(findings, vec![finding(22, "SSH", "admin", "123456")]);

    let lines = runner.command_lines();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "-n -p 22 --script ssh-brute 10.0.0.5 -oX -");
    let recheck_file = dict.path().join("10.0.0.5_22_credentials.lst");
    assert_eq!(
        lines[1],
        format!(
            "-n -p 22 --script ssh-brute --script-args brute.mode=creds,brute.credfile={} 10.0.0.5 -oX -",
            recheck_file.display()
        )
    );
    assert!(!recheck_file.exists());
}

#[tokio::test]
async fn form_credentials_are_rechecked_on_the_same_form() {
    let dict = tempfile::tempdir().unwrap();
    let store = memory_store();
    let extras = ScanExtras::from([(
        "http-form-brute".to_string(),
        vec![FormExtra {
            path: Some("/oauth".into()),
            ..Default::default()
        }],
    )]);
    save_extras(&store, Some(&extras)).await.unwrap();

    // the login only exists on /oauth
    let runner = FakeRunner::new(|args| {
        let on_oauth = args.iter().any(|a| a.contains("http-form-brute.path=/oauth"));
        let creds: &[(&str, &str)] = if on_oauth { &[("admin", "admin")] } else { &[] };
        Ok(accounts_xml("http-form-brute", creds))
    });
    let services = ServiceTable::from([(
        "tcp_80".to_string(),
        ServiceConfig {
            service_name: "HTTP".into(),
            protocol: "tcp".into(),
            port: 80,
            scripts: vec![ScriptConfig::new("http-form-brute")
                .with_script_args("unpwdb.timelimit=60m")
                .with_other_args("-v")],
        },
    )]);
    let probe = probe_on_store(runner.clone(), dict.path(), services, false, &["10.0.0.5/32"], store);

    let findings = probe.scan(&target(), CancellationToken::new()).await;
    assert_eq!(findings, vec![finding(80, "HTTP", "admin", "admin")]);

    let lines = runner.command_lines();
    assert_eq!(lines.len(), 2);
    let recheck_file = dict.path().join("10.0.0.5_80_credentials.lst");
    assert_eq!(
        lines[1],
        format!(
            "-n -p 80 --script http-form-brute -v --script-args brute.mode=creds,brute.credfile={},http-form-brute.path=/oauth 10.0.0.5 -oX -",
            recheck_file.display()
        )
    );
}

#[tokio::test]
async fn mac_hosts_are_probed_on_ipv4_only() {
    let dict = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|_| Ok(EMPTY_XML.to_string()));
    let probe = probe_with(
        runner.clone(),
        dict.path(),
        ServiceTable::from([service("SSH", 22, &["ssh-brute"])]),
        true,
        &["fe80::1/128", "10.0.0.5/32"],
    );

    probe.scan(&target(), CancellationToken::new()).await;
    assert_eq!(runner.command_lines(), vec!["-n -p 22 --script ssh-brute 10.0.0.5 -oX -"]);
}

#[tokio::test]
async fn skip_verify_trusts_first_pass() {
    let dict = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|_| Ok(accounts_xml("ssh-brute", &[("admin", "123456"), ("guest", "<empty>")])));
    let probe = probe_with(
        runner.clone(),
        dict.path(),
        ServiceTable::from([service("SSH", 22, &["ssh-brute"])]),
        true,
        &["10.0.0.5/32"],
    );

    let findings = probe.scan(&target(), CancellationToken::new()).await;
    assert_eq!(
        findings,
        vec![finding(22, "SSH", "admin", "123456"), finding(22, "SSH", "guest", "")]
    );
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn cancellation_returns_partial_findings() {
    let dict = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    let runner = FakeRunner::new(move |args| {
        trip.cancel();
        Ok(accounts_xml(&script_of(args), &[("root", "root")]))
    });
    let probe = probe_with(
        runner.clone(),
        dict.path(),
        ServiceTable::from([service("FTP", 21, &["ftp-brute"]), service("SSH", 22, &["ssh-brute"])]),
        true,
        &["10.0.0.5/32"],
    );

    let findings = probe.scan(&target(), cancel).await;
    assert_eq!(findings, vec![finding(21, "FTP", "root", "root")]);
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn failed_invocation_does_not_abort_host() {
    let dict = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|args| {
        if script_of(args) == "ftp-brute" {
            Err(ProbeError::Timeout(Duration::from_secs(30)))
        } else {
            Ok(accounts_xml("ssh-brute", &[("pi", "raspberry")]))
        }
    });
    let probe = probe_with(
        runner.clone(),
        dict.path(),
        ServiceTable::from([service("FTP", 21, &["ftp-brute"]), service("SSH", 22, &["ssh-brute"])]),
        true,
        &["10.0.0.5/32"],
    );

    let findings = probe.scan(&target(), CancellationToken::new()).await;
    assert_eq!(findings, vec![finding(22, "SSH", "pi", "raspberry")]);
    assert_eq!(runner.calls().len(), 2);
}

#[tokio::test]
async fn address_ranges_are_not_probed() {
    let dict = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|_| Ok(EMPTY_XML.to_string()));
    let services = ServiceTable::from([service("SSH", 22, &["ssh-brute"])]);

    let only_range = probe_with(runner.clone(), dict.path(), services.clone(), true, &["10.8.0.0/24"]);
    assert!(only_range.scan(&target(), CancellationToken::new()).await.is_empty());
    assert!(runner.calls().is_empty());

    let mixed = probe_with(
        runner.clone(),
        dict.path(),
        services,
        true,
        &["10.8.0.0/24", "10.8.0.7/32", "10.8.0.7/32"],
    );
    mixed.scan(&target(), CancellationToken::new()).await;
    assert_eq!(runner.command_lines(), vec!["-n -p 22 --script ssh-brute 10.8.0.7 -oX -"]);
}

#[tokio::test]
async fn duplicate_findings_are_collapsed() {
    let dict = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|args| Ok(accounts_xml(&script_of(args), &[("admin", "admin")])));
    let probe = probe_with(
        runner.clone(),
        dict.path(),
        ServiceTable::from([service("HTTP", 80, &["http-brute", "http-form-brute"])]),
        true,
        &["10.0.0.5/32"],
    );

    let findings = probe.scan(&target(), CancellationToken::new()).await;
    assert_eq!(findings, vec![finding(80, "HTTP", "admin", "admin")]);
    assert_eq!(runner.calls().len(), 2);
}

#[tokio::test]
async fn redis_version_means_open_access() {
    let dict = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|_| {
        Ok("<?xml version=\"1.0\"?><nmaprun><host><ports>\
            <port protocol=\"tcp\" portid=\"6379\"><state state=\"open\"/>\
            <service name=\"redis\" version=\"6.0.16\"/>\
            <script id=\"redis-info\" output=\"\"/></port></ports></host></nmaprun>"
            .to_string())
    });
    let probe = probe_with(
        runner.clone(),
        dict.path(),
        ServiceTable::from([service("REDIS", 6379, &["redis-info"])]),
        false,
        &["10.0.0.5/32"],
    );

    let findings = probe.scan(&target(), CancellationToken::new()).await;
    assert_eq!(findings, vec![finding(6379, "REDIS", "", "")]);
    assert_eq!(runner.calls().len(), 1);
}
