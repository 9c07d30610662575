use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_ENDPOINT_URL: &str = "http://localhost:8085/data.json";

/// Node of the hardware-monitor JSON tree (`Text` / `Value` / `Children`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SensorNode {
    #[serde(rename = "Text", default)]
    pub text: String,
    #[serde(rename = "Value", default)]
    pub value: Option<String>,
    #[serde(rename = "Children", default)]
    pub children: Vec<SensorNode>,
}

#[derive(Debug, Clone, Copy)]
pub enum NodeMatch {
    Any,
    Exact(&'static str),
    Contains(&'static str),
}

impl NodeMatch {
    fn matches(&self, text: &str) -> bool {
        match self {
            NodeMatch::Any => true,
            NodeMatch::Exact(s) => text == *s,
            NodeMatch::Contains(s) => text.contains(s),
        }
    }
}

/// Root -> computer -> hardware -> category -> sensor.
pub type SensorPath = [NodeMatch; 4];

pub const CPU_PACKAGE_TEMP: SensorPath = [
    NodeMatch::Any,
    NodeMatch::Any,
    NodeMatch::Exact("Temperatures"),
    NodeMatch::Contains("CPU Package"),
];

pub const CPU_TOTAL_LOAD: SensorPath = [
    NodeMatch::Any,
    NodeMatch::Any,
    NodeMatch::Exact("Load"),
    NodeMatch::Contains("CPU Total"),
];

pub const GPU_CORE_TEMP: SensorPath = [
    NodeMatch::Any,
    NodeMatch::Any,
    NodeMatch::Exact("Temperatures"),
    NodeMatch::Contains("GPU Core"),
];

pub const GPU_CORE_LOAD: SensorPath = [
    NodeMatch::Any,
    NodeMatch::Any,
    NodeMatch::Exact("Load"),
    NodeMatch::Contains("GPU Core"),
];

pub const GPU_MEMORY_USED: SensorPath = [
    NodeMatch::Any,
    NodeMatch::Any,
    NodeMatch::Contains("Data"),
    NodeMatch::Contains("GPU Memory Used"),
];

pub const GPU_MEMORY_TOTAL: SensorPath = [
    NodeMatch::Any,
    NodeMatch::Any,
    NodeMatch::Contains("Data"),
    NodeMatch::Contains("GPU Memory Total"),
];

impl SensorNode {
    /// First leaf value reachable through `path`, depth-first.
    pub fn lookup(&self, path: &[NodeMatch]) -> Option<&str> {
        let Some((head, rest)) = path.split_first() else {
            return self.value.as_deref();
        };
        self.children
            .iter()
            .filter(|child| head.matches(&child.text))
            .find_map(|child| child.lookup(rest))
    }

    pub fn lookup_number(&self, path: &[NodeMatch]) -> Option<f64> {
        self.lookup(path).and_then(parse_leading_number)
    }
}

/// Parses the leading numeric token of a unit-suffixed value such as `"45,5 °C"`.
pub fn parse_leading_number(raw: &str) -> Option<f64> {
    let token = raw.split_whitespace().next()?;
    let normalized = token.replace(',', ".");
    if let Ok(v) = normalized.parse::<f64>() {
        return v.is_finite().then_some(v);
    }

    // Units glued to the number ("45.5°C", "12%").
    let numeric: String = normalized
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+')
        .collect();
    numeric.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Clone)]
pub struct MonitorEndpoint {
    client: Client,
    url: String,
    timeout: Duration,
}

impl MonitorEndpoint {
    pub fn new(client: Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn fetch(&self) -> Result<SensorNode, String> {
        let request = self.client.get(&self.url).timeout(self.timeout);
        let fut = async {
            let resp = request.send().await.map_err(|e| e.to_string())?;
            let resp = resp.error_for_status().map_err(|e| e.to_string())?;
            let body = resp.bytes().await.map_err(|e| e.to_string())?;
            serde_json::from_slice::<SensorNode>(&body).map_err(|e| e.to_string())
        };

        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_elapsed) => {
                debug!(url = %self.url, "monitoring endpoint timeout");
                Err("timeout".to_string())
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_tree() -> SensorNode {
    let json = r#"{
        "Text": "Sensor",
        "Children": [{
            "Text": "DESKTOP-TEST",
            "Children": [
                {
                    "Text": "AMD Ryzen 5 4600H",
                    "Children": [
                        {"Text": "Load", "Children": [
                            {"Text": "CPU Core #1", "Value": "10,0 %", "Children": []},
                            {"Text": "CPU Total", "Value": "23,5 %", "Children": []}
                        ]},
                        {"Text": "Temperatures", "Children": [
                            {"Text": "CPU Package", "Value": "61,3 °C", "Children": []}
                        ]}
                    ]
                },
                {
                    "Text": "AMD Radeon Graphics",
                    "Children": [
                        {"Text": "Temperatures", "Children": [
                            {"Text": "GPU Core", "Value": "54,0 °C", "Children": []}
                        ]},
                        {"Text": "Load", "Children": [
                            {"Text": "GPU Core", "Value": "7,0 %", "Children": []}
                        ]},
                        {"Text": "SmallData", "Children": [
                            {"Text": "GPU Memory Used", "Value": "512 MB", "Children": []},
                            {"Text": "GPU Memory Total", "Value": "2048 MB", "Children": []}
                        ]}
                    ]
                }
            ]
        }]
    }"#;
    serde_json::from_str(json).expect("sample tree")
}
