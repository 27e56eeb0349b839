//! 代理核心配置文档的生成与改写

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::net::Ipv4Addr;
use tokio::net::TcpListener;
use tracing::debug;

use crate::config::{CoreSettings, FragmentSettings};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{Error, Result};

/// 本地入站协议
pub const LOCAL_PROXY_PROTOCOLS: [&str; 3] = ["http", "mixed", "socks"];

pub const LOOPBACK: &str = "127.0.0.1";
pub const PROXY_TAG: &str = "proxy";
pub const DIRECT_TAG: &str = "direct";
pub const FRAGMENT_TAG: &str = "fragment";
pub const INBOUND_TAG: &str = "http-in";

/// 交给代理核心的完整配置
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfigDocument {
    root: Value,
}

impl ProxyConfigDocument {
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// 序列化为传给核心的文本
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.root).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// 本地代理入站端口（第一个匹配的入站）
    pub fn local_port(&self) -> Option<u16> {
        self.root
            .get("inbounds")?
            .as_array()?
            .iter()
            .filter(|i| is_local_proxy_inbound(i))
            .find_map(|i| i.get("port").and_then(Value::as_u64))
            .and_then(|p| u16::try_from(p).ok())
    }
}

/// 配置中已有的分片参数（仅用于显示）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentInfo {
    pub packets: String,
    pub length: String,
    pub interval: String,
}

impl From<&FragmentSettings> for FragmentInfo {
    fn from(settings: &FragmentSettings) -> Self {
        Self {
            packets: settings.packets.clone(),
            length: settings.length.clone(),
            interval: settings.interval.clone(),
        }
    }
}

/// 找一个当前空闲的本地端口
///
/// 绑定 127.0.0.1:0 后立即释放，由核心进程重新绑定。
pub async fn free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    debug!("分配本地端口 {}", port);
    Ok(port)
}

/// 从连接描述生成完整配置
///
/// `fragment` 为 None 时分片出站仍然存在，但 settings 为空且不被引用。
pub fn synthesize(
    descriptor: &ConnectionDescriptor,
    fragment: Option<&FragmentSettings>,
    local_port: u16,
    core: &CoreSettings,
) -> ProxyConfigDocument {
    let mut stream = Map::new();
    stream.insert("network".to_string(), json!(descriptor.network));
    stream.insert("security".to_string(), json!(descriptor.security));

    if descriptor.security == "tls" {
        let server_name = [&descriptor.sni, &descriptor.host, &descriptor.address]
            .into_iter()
            .find(|s| !s.is_empty())
            .cloned()
            .unwrap_or_default();
        let mut tls = Map::new();
        tls.insert("serverName".to_string(), json!(server_name));
        tls.insert("allowInsecure".to_string(), json!(false));
        if !descriptor.fingerprint.is_empty() {
            tls.insert("fingerprint".to_string(), json!(descriptor.fingerprint));
        }
        stream.insert("tlsSettings".to_string(), Value::Object(tls));
    }

    if let Some((key, settings)) = transport_settings(descriptor) {
        stream.insert(key.to_string(), settings);
    }

    if fragment.is_some() {
        stream.insert("sockopt".to_string(), json!({ "dialerProxy": FRAGMENT_TAG }));
    }

    let proxy_outbound = json!({
        "tag": PROXY_TAG,
        "protocol": descriptor.protocol,
        "settings": {
            "vnext": [{
                "address": descriptor.address,
                "port": descriptor.port,
                "users": [{
                    "id": descriptor.id,
                    "encryption": descriptor.encryption,
                }]
            }]
        },
        "streamSettings": Value::Object(stream),
    });

    let fragment_settings = match fragment {
        Some(f) => json!({
            "fragment": {
                "packets": f.packets,
                "length": f.length,
                "interval": f.interval,
            }
        }),
        None => json!({}),
    };

    let root = json!({
        "log": { "loglevel": core.log_level },
        "dns": { "servers": core.dns_servers },
        "inbounds": [{
            "tag": INBOUND_TAG,
            "protocol": "http",
            "listen": LOOPBACK,
            "port": local_port,
            "settings": {}
        }],
        "outbounds": [
            proxy_outbound,
            { "tag": DIRECT_TAG, "protocol": "freedom", "settings": {} },
            { "tag": FRAGMENT_TAG, "protocol": "freedom", "settings": fragment_settings },
        ],
        "routing": {
            "domainStrategy": "AsIs",
            "rules": [{
                "type": "field",
                "network": "tcp,udp",
                "outboundTag": PROXY_TAG
            }]
        }
    });

    ProxyConfigDocument::from_value(root)
}

/// 按传输类型填写对应的 streamSettings 子项；tcp 等不需要
fn transport_settings(descriptor: &ConnectionDescriptor) -> Option<(&'static str, Value)> {
    let path = if descriptor.path.is_empty() { "/" } else { descriptor.path.as_str() };
    match descriptor.network.as_str() {
        "ws" => {
            let mut ws = Map::new();
            ws.insert("path".to_string(), json!(path));
            if !descriptor.host.is_empty() {
                ws.insert("headers".to_string(), json!({ "Host": descriptor.host }));
            }
            Some(("wsSettings", Value::Object(ws)))
        }
        "httpupgrade" => Some((
            "httpupgradeSettings",
            json!({ "path": path, "host": descriptor.host }),
        )),
        "xhttp" | "splithttp" => Some((
            "xhttpSettings",
            json!({ "path": path, "host": descriptor.host }),
        )),
        "grpc" => Some((
            "grpcSettings",
            json!({ "serviceName": descriptor.path }),
        )),
        _ => None,
    }
}

/// 改写已有配置：只把本地代理入站的端口和监听地址换掉，其余内容不动
pub fn patch_inbounds(document: &Value, local_port: u16) -> ProxyConfigDocument {
    let mut root = document.clone();
    if let Some(inbounds) = root.get_mut("inbounds").and_then(Value::as_array_mut) {
        for inbound in inbounds.iter_mut().filter(|i| is_local_proxy_inbound(i)) {
            if let Some(obj) = inbound.as_object_mut() {
                obj.insert("port".to_string(), json!(local_port));
                obj.insert("listen".to_string(), json!(LOOPBACK));
            }
        }
    }
    ProxyConfigDocument::from_value(root)
}

fn is_local_proxy_inbound(inbound: &Value) -> bool {
    inbound
        .get("protocol")
        .and_then(Value::as_str)
        .is_some_and(|p| LOCAL_PROXY_PROTOCOLS.contains(&p))
}

/// 检测配置文件中已有的分片设置
pub fn detect_fragment(document: &Value) -> Option<FragmentInfo> {
    let fragment = document
        .get("outbounds")?
        .as_array()?
        .iter()
        .find_map(|o| o.get("settings").and_then(|s| s.get("fragment")))?;
    let field = |key: &str| match fragment.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    Some(FragmentInfo {
        packets: field("packets"),
        length: field("length"),
        interval: field("interval"),
    })
}
