//! 输入解析：把 vless:// 链接或已有的核心配置文件变成统一的连接描述

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};

/// 链接前缀
pub const VLESS_SCHEME: &str = "vless://";

/// 可以从配置文件中识别的代理出站协议
pub const PROXY_PROTOCOLS: [&str; 3] = ["vless", "vmess", "trojan"];

/// 链接没有 `#label` 时使用的名称
pub const DEFAULT_LABEL: &str = "Unnamed";

/// 配置文件缺字段时的占位值
pub const UNKNOWN: &str = "unknown";

/// 输入来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// 直接给出的链接
    DirectUrl,
    /// 已有的核心配置文件
    ExistingConfig,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::DirectUrl => write!(f, "direct-url"),
            Provenance::ExistingConfig => write!(f, "existing-config"),
        }
    }
}

/// 连接描述，与输入格式无关
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// 出站协议（链接输入固定为 vless）
    pub protocol: String,
    /// 用户ID
    pub id: String,
    /// 服务器地址
    pub address: String,
    /// 服务器端口；配置文件缺失端口时为0
    pub port: u16,
    /// 加密方式
    pub encryption: String,
    /// 传输层安全（none/tls/...）
    pub security: String,
    /// SNI
    pub sni: String,
    /// TLS 指纹
    pub fingerprint: String,
    /// 传输类型（tcp/ws/grpc/...）
    pub network: String,
    /// Host 头
    pub host: String,
    /// 路径
    pub path: String,
    /// 显示名称
    pub label: String,
}

impl ConnectionDescriptor {
    /// 用于显示的 `address:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// 解析结果
#[derive(Debug, Clone)]
pub struct DerivedInput {
    pub descriptor: ConnectionDescriptor,
    pub provenance: Provenance,
    /// 配置文件输入时保存完整的原始文档
    pub document: Option<Value>,
}

/// 根据输入判断来源并解析
pub fn derive(input: &str) -> Result<DerivedInput> {
    let trimmed = input.trim();
    if trimmed.starts_with(VLESS_SCHEME) {
        let descriptor = parse_link(trimmed)?;
        return Ok(DerivedInput {
            descriptor,
            provenance: Provenance::DirectUrl,
            document: None,
        });
    }

    let path = Path::new(trimmed);
    if !path.exists() {
        return Err(Error::InputNotRecognized(trimmed.to_string()));
    }
    let (descriptor, document) = load_config_file(path)?;
    Ok(DerivedInput {
        descriptor,
        provenance: Provenance::ExistingConfig,
        document: Some(document),
    })
}

/// 解析 vless:// 链接
pub fn parse_link(link: &str) -> Result<ConnectionDescriptor> {
    let without_prefix = link
        .strip_prefix(VLESS_SCHEME)
        .ok_or_else(|| Error::MalformedDescriptor(format!("missing {} prefix", VLESS_SCHEME)))?;

    let (main_part, label) = match without_prefix.split_once('#') {
        Some((main, fragment)) => {
            let label = urlencoding::decode(fragment)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| fragment.to_string());
            let label = if label.is_empty() { DEFAULT_LABEL.to_string() } else { label };
            (main, label)
        }
        None => (without_prefix, DEFAULT_LABEL.to_string()),
    };

    let (id, server_part) = main_part
        .split_once('@')
        .ok_or_else(|| Error::MalformedDescriptor("missing '@' between id and server".to_string()))?;
    if id.is_empty() {
        return Err(Error::MalformedDescriptor("empty id".to_string()));
    }
    if server_part.is_empty() {
        return Err(Error::MalformedDescriptor("empty server part".to_string()));
    }

    let (addr_port, query) = match server_part.split_once('?') {
        Some((addr_port, query)) => (addr_port, query),
        None => (server_part, ""),
    };
    // 去掉 `host:port/?...` 形式里多余的斜杠
    let addr_port = addr_port.trim_end_matches('/');

    let (host, port_str) = addr_port
        .rsplit_once(':')
        .ok_or_else(|| Error::MalformedDescriptor("missing ':port'".to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::MalformedDescriptor("empty host".to_string()));
    }
    let port: u16 = port_str
        .parse()
        .map_err(|_| Error::MalformedDescriptor(format!("invalid port '{}'", port_str)))?;
    if port == 0 {
        return Err(Error::MalformedDescriptor("port must be 1-65535".to_string()));
    }

    let params = parse_query(query);
    let param = |key: &str| params.get(key).cloned().unwrap_or_default();
    let or = |key: &str, fallback: &str| {
        params
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    };

    let descriptor = ConnectionDescriptor {
        protocol: "vless".to_string(),
        id: id.to_string(),
        address: host.to_string(),
        port,
        encryption: or("encryption", "none"),
        security: or("security", "none"),
        sni: param("sni"),
        fingerprint: params
            .get("fingerprint")
            .or_else(|| params.get("fp"))
            .cloned()
            .unwrap_or_default(),
        network: or("type", "tcp"),
        host: param("host"),
        path: param("path"),
        label,
    };
    debug!("解析链接: {:?}", descriptor);
    Ok(descriptor)
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .filter_map(|p| {
            let mut parts = p.splitn(2, '=');
            let key = parts.next()?.to_string();
            let raw = parts.next().unwrap_or("");
            let value = urlencoding::decode(raw)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| raw.to_string());
            Some((key, value))
        })
        .collect()
}

/// 读取并解析配置文件
fn load_config_file(path: &Path) -> Result<(ConnectionDescriptor, Value)> {
    let content = fs::read_to_string(path)?;
    let document: Value = serde_json::from_str(&content).map_err(|source| Error::InvalidJson {
        path: path.display().to_string(),
        source,
    })?;
    let descriptor = descriptor_from_document(&document)
        .ok_or_else(|| Error::NoProxyOutbound(path.display().to_string()))?;
    Ok((descriptor, document))
}

/// 找到第一个代理出站并直接投影为描述；没有则返回 None
pub fn descriptor_from_document(document: &Value) -> Option<ConnectionDescriptor> {
    let outbound = document
        .get("outbounds")?
        .as_array()?
        .iter()
        .find(|o| {
            o.get("protocol")
                .and_then(Value::as_str)
                .is_some_and(|p| PROXY_PROTOCOLS.contains(&p))
        })?;

    let protocol = str_at(outbound, &["protocol"]).unwrap_or(UNKNOWN).to_string();
    let settings = outbound.get("settings");
    // vless/vmess 用 vnext，trojan 用 servers
    let server = settings
        .and_then(|s| s.get("vnext").or_else(|| s.get("servers")))
        .and_then(Value::as_array)
        .and_then(|servers| servers.first());

    let address = server
        .and_then(|s| str_at(s, &["address"]))
        .unwrap_or(UNKNOWN)
        .to_string();
    let port = server
        .and_then(|s| s.get("port"))
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(0);
    let user = server
        .and_then(|s| s.get("users"))
        .and_then(Value::as_array)
        .and_then(|users| users.first());
    let id = user
        .and_then(|u| str_at(u, &["id"]))
        .or_else(|| server.and_then(|s| str_at(s, &["password"])))
        .unwrap_or(UNKNOWN)
        .to_string();
    let encryption = user
        .and_then(|u| str_at(u, &["encryption"]))
        .unwrap_or("none")
        .to_string();

    let stream = outbound.get("streamSettings");
    let stream_str = |path: &[&str]| stream.and_then(|s| str_at(s, path));
    let network = stream_str(&["network"]).unwrap_or("tcp").to_string();
    let transport_key = format!("{}Settings", network);

    Some(ConnectionDescriptor {
        protocol,
        id,
        address,
        port,
        encryption,
        security: stream_str(&["security"]).unwrap_or("none").to_string(),
        sni: stream_str(&["tlsSettings", "serverName"])
            .or_else(|| stream_str(&["realitySettings", "serverName"]))
            .unwrap_or_default()
            .to_string(),
        fingerprint: stream_str(&["tlsSettings", "fingerprint"])
            .or_else(|| stream_str(&["realitySettings", "fingerprint"]))
            .unwrap_or_default()
            .to_string(),
        host: stream_str(&[transport_key.as_str(), "host"])
            .or_else(|| stream_str(&[transport_key.as_str(), "headers", "Host"]))
            .unwrap_or_default()
            .to_string(),
        path: stream_str(&[transport_key.as_str(), "path"])
            .or_else(|| stream_str(&[transport_key.as_str(), "serviceName"]))
            .unwrap_or_default()
            .to_string(),
        network,
        label: str_at(outbound, &["tag"]).unwrap_or(UNKNOWN).to_string(),
    })
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(*key))
        .and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio_test::assert_err;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parse_full_ws_link() {
        let d = parse_link("vless://u1@host1:443?security=tls&type=ws&path=/p&sni=host1#label1").unwrap();
        assert_eq!(d.id, "u1");
        assert_eq!(d.address, "host1");
        assert_eq!(d.port, 443);
        assert_eq!(d.security, "tls");
        assert_eq!(d.network, "ws");
        assert_eq!(d.path, "/p");
        assert_eq!(d.sni, "host1");
        assert_eq!(d.label, "label1");
        assert_eq!(d.encryption, "none");
        assert_eq!(d.protocol, "vless");
    }

    #[test]
    fn defaults_without_query_or_label() {
        let d = parse_link("vless://uuid@10.0.0.1:8080").unwrap();
        assert_eq!(d.port, 8080);
        assert_eq!(d.security, "none");
        assert_eq!(d.network, "tcp");
        assert_eq!(d.label, DEFAULT_LABEL);
        assert!(d.sni.is_empty());
        assert!(d.path.is_empty());
    }

    #[test]
    fn decodes_label_and_query_values() {
        let d = parse_link(
            "vless://id@cdn.example.com:2053?type=ws&path=%2Fws%3Fed%3D2048&host=cdn.example.com&fp=chrome#My%20Server",
        )
        .unwrap();
        assert_eq!(d.label, "My Server");
        assert_eq!(d.path, "/ws?ed=2048");
        assert_eq!(d.host, "cdn.example.com");
        assert_eq!(d.fingerprint, "chrome");
    }

    #[test]
    fn port_is_number_between_colon_and_query() {
        for (link, port) in [
            ("vless://a@h:1?x=y", 1),
            ("vless://a@h:65535", 65535),
            ("vless://a@h.example:8443/?type=tcp", 8443),
            ("vless://a@[2001:db8::1]:443?type=tcp", 443),
        ] {
            assert_eq!(parse_link(link).unwrap().port, port, "{}", link);
        }
    }

    #[test]
    fn bracketed_ipv6_host_is_unwrapped() {
        let d = parse_link("vless://a@[2001:db8::1]:443").unwrap();
        assert_eq!(d.address, "2001:db8::1");
    }

    #[test]
    fn malformed_links_are_rejected() {
        for link in [
            "vless://uuidhost:443?type=tcp",
            "vless://uuid@host?type=tcp",
            "vless://uuid@host:abc?type=tcp",
            "vless://uuid@host:70000",
            "vless://uuid@host:0",
            "vless://@host:443",
            "vless://uuid@:443",
            "vless://uuid@",
        ] {
            let err = parse_link(link).unwrap_err();
            assert!(matches!(err, Error::MalformedDescriptor(_)), "{}: {:?}", link, err);
        }
    }

    #[test]
    fn unknown_input_is_not_recognized() {
        let err = assert_err!(derive("definitely-not-a-file-or-link.json"));
        assert!(matches!(err, Error::InputNotRecognized(_)));
    }

    #[test]
    fn derive_link_has_direct_provenance() {
        let input = derive("  vless://u@h:443#x ").unwrap();
        assert_eq!(input.provenance, Provenance::DirectUrl);
        assert!(input.document.is_none());
    }

    #[test]
    fn derive_config_file_projects_first_proxy_outbound() {
        let doc = json!({
            "inbounds": [{"protocol": "socks", "listen": "0.0.0.0", "port": 1080}],
            "outbounds": [
                {"protocol": "freedom", "tag": "direct"},
                {
                    "protocol": "vless",
                    "tag": "my-proxy",
                    "settings": {"vnext": [{"address": "srv.example", "port": 8443,
                        "users": [{"id": "abc", "encryption": "none"}]}]},
                    "streamSettings": {"network": "ws", "security": "tls",
                        "tlsSettings": {"serverName": "sni.example"},
                        "wsSettings": {"path": "/ray", "headers": {"Host": "cdn.example"}}}
                },
                {"protocol": "trojan", "tag": "second"}
            ]
        });
        let file = create_temp_file(&doc.to_string());
        let input = derive(file.path().to_str().unwrap()).unwrap();

        assert_eq!(input.provenance, Provenance::ExistingConfig);
        assert_eq!(input.document.as_ref(), Some(&doc));
        let d = input.descriptor;
        assert_eq!(d.protocol, "vless");
        assert_eq!(d.address, "srv.example");
        assert_eq!(d.port, 8443);
        assert_eq!(d.id, "abc");
        assert_eq!(d.network, "ws");
        assert_eq!(d.security, "tls");
        assert_eq!(d.sni, "sni.example");
        assert_eq!(d.path, "/ray");
        assert_eq!(d.host, "cdn.example");
        assert_eq!(d.label, "my-proxy");
    }

    #[test]
    fn trojan_outbound_uses_servers_and_placeholders() {
        let doc = json!({
            "outbounds": [{"protocol": "trojan",
                "settings": {"servers": [{"address": "t.example", "port": 443, "password": "pw"}]}}]
        });
        let d = descriptor_from_document(&doc).unwrap();
        assert_eq!(d.address, "t.example");
        assert_eq!(d.id, "pw");
        assert_eq!(d.network, "tcp");
        assert_eq!(d.security, "none");
        assert_eq!(d.label, UNKNOWN);
    }

    #[test]
    fn config_without_proxy_outbound_fails() {
        let file = create_temp_file(r#"{"outbounds": [{"protocol": "freedom"}]}"#);
        let err = derive(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::NoProxyOutbound(_)));
    }

    #[test]
    fn config_with_bad_json_fails() {
        let file = create_temp_file("{ not json");
        let err = derive(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::InvalidJson { .. }));
    }
}
