//! Protobuf messages and client for the agent control service
//!
//! Hand-maintained equivalent of what tonic-build emits for
//! `fleet/agent/v1/agent_control.proto`:
//!
//! ```proto
//! service AgentControl {
//!   rpc StartInstance(InstanceCommand) returns (CommandAck);
//!   rpc StopInstance(InstanceCommand) returns (CommandAck);
//! }
//! ```

pub mod fleet {
    pub mod agent {
        pub mod v1 {
            use prost::Message;

            #[derive(Clone, PartialEq, Message)]
            pub struct InstanceCommand {
                #[prost(string, tag = "1")]
                pub instance_id: String,
                #[prost(string, tag = "2")]
                pub version: String,
                #[prost(string, tag = "3")]
                pub agent_id: String,
            }

            #[derive(Clone, PartialEq, Message)]
            pub struct CommandAck {
                #[prost(bool, tag = "1")]
                pub accepted: bool,
                #[prost(string, tag = "2")]
                pub message: String,
            }

            pub mod agent_control_client {
                use super::*;
                use tonic::codegen::*;
                use tonic::transport::Uri;

                #[derive(Debug, Clone)]
                pub struct AgentControlClient<T> {
                    inner: tonic::client::Grpc<T>,
                }

                impl AgentControlClient<tonic::transport::Channel> {
                    pub fn new(channel: tonic::transport::Channel) -> Self {
                        let inner = tonic::client::Grpc::new(channel);
                        Self { inner }
                    }
                }

                impl<T> AgentControlClient<T>
                where
                    T: tonic::client::GrpcService<tonic::body::BoxBody>,
                    T::Error: Into<StdError>,
                    T::ResponseBody: Body<Data = Bytes> + Send + 'static,
                    <T::ResponseBody as Body>::Error: Into<StdError> + Send,
                {
                    pub fn with_origin(inner: T, origin: Uri) -> Self {
                        let inner = tonic::client::Grpc::with_origin(inner, origin);
                        Self { inner }
                    }

                    pub async fn start_instance(
                        &mut self,
                        request: impl tonic::IntoRequest<InstanceCommand>,
                    ) -> Result<tonic::Response<CommandAck>, tonic::Status> {
                        self.inner.ready().await.map_err(|e| {
                            tonic::Status::new(
                                tonic::Code::Unknown,
                                format!("Service was not ready: {}", e.into()),
                            )
                        })?;
                        let codec = tonic::codec::ProstCodec::default();
                        let path = http::uri::PathAndQuery::from_static(
                            "/fleet.agent.v1.AgentControl/StartInstance",
                        );
                        self.inner.unary(request.into_request(), path, codec).await
                    }

                    pub async fn stop_instance(
                        &mut self,
                        request: impl tonic::IntoRequest<InstanceCommand>,
                    ) -> Result<tonic::Response<CommandAck>, tonic::Status> {
                        self.inner.ready().await.map_err(|e| {
                            tonic::Status::new(
                                tonic::Code::Unknown,
                                format!("Service was not ready: {}", e.into()),
                            )
                        })?;
                        let codec = tonic::codec::ProstCodec::default();
                        let path = http::uri::PathAndQuery::from_static(
                            "/fleet.agent.v1.AgentControl/StopInstance",
                        );
                        self.inner.unary(request.into_request(), path, codec).await
                    }
                }
            }
        }
    }
}

pub use fleet::agent::v1::agent_control_client::AgentControlClient;
pub use fleet::agent::v1::*;

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_instance_command_wire_format() {
        let command = InstanceCommand {
            instance_id: "p1".into(),
            version: "2".into(),
            agent_id: "a1".into(),
        };
        let bytes = command.encode_to_vec();
        // Field 1, length-delimited, two bytes "p1"
        assert_eq!(&bytes[..4], &[0x0a, 0x02, b'p', b'1']);
        assert_eq!(InstanceCommand::decode(bytes.as_slice()).unwrap(), command);
    }

    #[test]
    fn test_empty_ack_decodes_to_rejected() {
        let ack = CommandAck::decode(&[][..]).unwrap();
        assert!(!ack.accepted);
        assert!(ack.message.is_empty());
    }
}
