//! Prost-based codec using envoy-types.

use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::message::{DiscoveryRequest, DiscoveryResponse, Node, ResourceAny};
use bytes::Bytes;
use envoy_types::pb::envoy::config::core::v3 as core;
use envoy_types::pb::envoy::service::discovery::v3 as discovery;
use envoy_types::pb::google::protobuf::{Struct, Value, value::Kind};
use envoy_types::pb::google::rpc::Status;
use prost::Message;

/// A codec that uses prost/envoy-types for serialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProstCodec;

fn node_to_proto(node: &Node) -> core::Node {
    let metadata = (!node.metadata.is_empty()).then(|| Struct {
        fields: node
            .metadata
            .iter()
            .map(|(key, value)| {
                (
                    key.clone(),
                    Value {
                        kind: Some(Kind::StringValue(value.clone())),
                    },
                )
            })
            .collect(),
    });

    core::Node {
        id: node.id.clone(),
        cluster: node.cluster.clone(),
        metadata,
        user_agent_name: node.user_agent_name.clone(),
        user_agent_version_type: Some(core::node::UserAgentVersionType::UserAgentVersion(
            node.user_agent_version.clone(),
        )),
        locality: node.locality.as_ref().map(|l| core::Locality {
            region: l.region.clone(),
            zone: l.zone.clone(),
            sub_zone: l.sub_zone.clone(),
        }),
        client_features: node.client_features.clone(),
        ..Default::default()
    }
}

impl XdsCodec for ProstCodec {
    fn encode_request(&self, request: &DiscoveryRequest<'_>) -> Result<Bytes> {
        let proto_request = discovery::DiscoveryRequest {
            version_info: request.version_info.to_owned(),
            node: Some(node_to_proto(request.node)),
            resource_names: request.resource_names.to_vec(),
            type_url: request.type_url.to_owned(),
            response_nonce: request.response_nonce.to_owned(),
            error_detail: request.error_detail.as_ref().map(|e| Status {
                code: e.code,
                message: e.message.clone(),
                details: vec![],
            }),
            ..Default::default()
        };

        Ok(proto_request.encode_to_vec().into())
    }

    fn decode_response(&self, bytes: Bytes) -> Result<DiscoveryResponse> {
        let proto_response = discovery::DiscoveryResponse::decode(bytes)
            .map_err(|e| Error::Decode(e.to_string()))?;

        Ok(DiscoveryResponse {
            version_info: proto_response.version_info,
            resources: proto_response
                .resources
                .into_iter()
                .map(|any| ResourceAny {
                    type_url: any.type_url,
                    value: any.value.into(),
                })
                .collect(),
            type_url: proto_response.type_url,
            nonce: proto_response.nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrorDetail, Locality};
    use envoy_types::pb::google::protobuf::Any;

    const LISTENER_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";

    #[test]
    fn test_encode_request_carries_node_identity() {
        let node = Node::new("grpc", "1.0")
            .with_id("node-1")
            .with_cluster("cluster-1")
            .with_locality(Locality {
                region: "us-west".to_string(),
                zone: "us-west-1a".to_string(),
                sub_zone: "rack-1".to_string(),
            })
            .with_metadata("team", "edge")
            .with_client_feature("envoy.lb.does_not_support_overprovisioning");
        let resource_names = vec!["listener-1".to_string()];
        let request = DiscoveryRequest {
            version_info: "",
            node: &node,
            type_url: LISTENER_URL,
            resource_names: &resource_names,
            response_nonce: "",
            error_detail: None,
        };

        let bytes = ProstCodec.encode_request(&request).unwrap();
        let decoded = discovery::DiscoveryRequest::decode(bytes).unwrap();
        assert_eq!(decoded.type_url, LISTENER_URL);
        assert_eq!(decoded.resource_names, resource_names);

        let node = decoded.node.unwrap();
        assert_eq!(node.id, "node-1");
        assert_eq!(node.cluster, "cluster-1");
        assert_eq!(node.user_agent_name, "grpc");
        match node.user_agent_version_type {
            Some(core::node::UserAgentVersionType::UserAgentVersion(version)) => {
                assert_eq!(version, "1.0");
            }
            _ => panic!("Expected UserAgentVersion to be set"),
        }
        let locality = node.locality.unwrap();
        assert_eq!(locality.region, "us-west");
        assert_eq!(locality.sub_zone, "rack-1");
        assert_eq!(
            node.client_features,
            vec!["envoy.lb.does_not_support_overprovisioning".to_string()]
        );
        let metadata = node.metadata.unwrap();
        assert_eq!(
            metadata.fields.get("team").and_then(|v| v.kind.clone()),
            Some(Kind::StringValue("edge".to_string()))
        );
    }

    #[test]
    fn test_encode_nack_keeps_version_and_error() {
        let node = Node::new("grpc", "1.0");
        let resource_names = vec!["res-1".to_string(), "res-2".to_string()];
        let request = DiscoveryRequest {
            version_info: "42",
            node: &node,
            type_url: "type.googleapis.com/test.Resource",
            resource_names: &resource_names,
            response_nonce: "nonce-abc",
            error_detail: Some(ErrorDetail::invalid_argument(
                "validation failed".to_string(),
            )),
        };

        let bytes = ProstCodec.encode_request(&request).unwrap();
        let proto_request = discovery::DiscoveryRequest::decode(bytes).unwrap();
        assert_eq!(proto_request.version_info, "42");
        assert_eq!(proto_request.response_nonce, "nonce-abc");
        assert!(proto_request.node.unwrap().metadata.is_none());
        let error = proto_request.error_detail.unwrap();
        assert_eq!(error.code, ErrorDetail::INVALID_ARGUMENT);
        assert_eq!(error.message, "validation failed");
    }

    #[test]
    fn test_decode_response() {
        let proto_response = discovery::DiscoveryResponse {
            version_info: "1".to_string(),
            type_url: LISTENER_URL.to_string(),
            nonce: "nonce-1".to_string(),
            resources: vec![Any {
                type_url: LISTENER_URL.to_string(),
                value: b"fake-listener-bytes".to_vec(),
            }],
            ..Default::default()
        };

        let response = ProstCodec
            .decode_response(proto_response.encode_to_vec().into())
            .unwrap();

        assert_eq!(response.version_info, "1");
        assert_eq!(response.type_url, LISTENER_URL);
        assert_eq!(response.nonce, "nonce-1");
        assert_eq!(response.resources.len(), 1);
        assert_eq!(response.resources[0].value.as_ref(), b"fake-listener-bytes");
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        let err = ProstCodec
            .decode_response(Bytes::from_static(&[0xff, 0xff, 0xff]))
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
