use std::io::Write;

use super::settings::{Settings, SiteDef};
use super::{load_config, load_config_from};
use crate::utils::error::GatewayError;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.gateway.site_id, 1);
    assert_eq!(settings.gateway.site_name, "local");
    assert_eq!(settings.gateway.listen, "0.0.0.0:31228");
    assert_eq!(settings.gateway.debug_listen, "0.0.0.0:8083");
    assert_eq!(settings.gateway.secure_listen, None);
    assert_eq!(settings.tls.server_name, "gateway");
    assert_eq!(settings.remote.workers, 5);
    assert_eq!(settings.remote.send_queue_depth, 8);
    assert!(settings.sites.is_empty());
    assert!(settings.tls.material().is_none());
}

#[test]
fn test_site_def_parsing() {
    let def: SiteDef = "hq,5,gw,tcp:10.5.0.5:31228,tcps:hq.example:31229".parse().unwrap();
    assert_eq!(def.name, "hq");
    assert_eq!(def.num, 5);
    assert!(def.gateway);
    assert_eq!(def.routes, vec!["tcp:10.5.0.5:31228", "tcps:hq.example:31229"]);
    assert_eq!(def.to_string(), "hq,5,gw,tcp:10.5.0.5:31228,tcps:hq.example:31229");

    let plain: SiteDef = "buoy,9".parse().unwrap();
    assert!(!plain.gateway);
    assert!(plain.routes.is_empty());

    // "gw" only counts right after the number.
    let odd: SiteDef = "ops,6,tcp:1.2.3.4:1,gw".parse().unwrap();
    assert!(!odd.gateway);
    assert_eq!(odd.routes.len(), 2);
}

#[test]
fn test_site_def_errors() {
    for bad in ["hq", "hq,five", ",5", ""] {
        let err = bad.parse::<SiteDef>().unwrap_err();
        assert!(matches!(err, GatewayError::SiteDef { .. }), "{bad}: {err}");
    }
}

#[test]
fn test_env_overrides() {
    temp_env::with_vars(
        [
            ("TIDEGATE__GATEWAY__SITE_ID", Some("14")),
            ("TIDEGATE__GATEWAY__SITE_NAME", Some("ship")),
            ("TIDEGATE__REMOTE__WORKERS", Some("2")),
            ("TIDEGATE__SITES", Some("hq,5,gw,tcp:10.5.0.5:31228 buoy,9")),
        ],
        || {
            let settings = load_config().unwrap();
            assert_eq!(settings.gateway.site_id, 14);
            assert_eq!(settings.gateway.site_name, "ship");
            assert_eq!(settings.gateway.listen, "0.0.0.0:31228");
            assert_eq!(settings.remote.workers, 2);
            assert_eq!(settings.remote.send_queue_depth, 8);
            assert_eq!(settings.sites.len(), 2);
            assert_eq!(settings.sites[0].name, "hq");
            assert_eq!(settings.sites[1].num, 9);
        },
    );
}

#[test]
fn test_config_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
sites = ["hq,5,gw,tcps:hq.example:31229"]

[gateway]
site_id = 7
secure_listen = "0.0.0.0:31229"

[tls]
ca = "/etc/tidegate/ca.pem"
cert = "/etc/tidegate/cert.pem"
key = "/etc/tidegate/key.pem"
"#
    )
    .unwrap();

    temp_env::with_vars_unset(["TIDEGATE__GATEWAY__SITE_ID", "TIDEGATE__SITES"], || {
        let settings = load_config_from(Some(file.path())).unwrap();
        assert_eq!(settings.gateway.site_id, 7);
        assert_eq!(settings.gateway.secure_listen.as_deref(), Some("0.0.0.0:31229"));
        assert_eq!(
            settings.tls.material(),
            Some(("/etc/tidegate/ca.pem", "/etc/tidegate/cert.pem", "/etc/tidegate/key.pem"))
        );
        assert_eq!(settings.sites[0].routes, vec!["tcps:hq.example:31229"]);
    });
}

#[test]
fn test_missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_config_from(Some(&dir.path().join("absent.toml"))).unwrap_err();
    assert!(matches!(err, GatewayError::Config(_)));
}

#[test]
fn test_bad_site_in_env_is_an_error() {
    temp_env::with_var("TIDEGATE__SITES", Some("nonumber"), || {
        assert!(matches!(load_config(), Err(GatewayError::SiteDef { .. })));
    });
}
