//! Call shape classification.
//!
//! Every method exposed by the server is registered here under its full
//! `/package.Service/Method` path. The timing layer looks the path up to pick
//! the label it reports under; unknown paths pass through untimed-by-shape.

use core::fmt;

/// The four gRPC call shapes, named after request/response cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    UnaryUnary,
    UnaryStream,
    StreamUnary,
    StreamStream,
}

impl CallShape {
    pub const ALL: [CallShape; 4] = [
        Self::UnaryUnary,
        Self::UnaryStream,
        Self::StreamUnary,
        Self::StreamStream,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            Self::UnaryUnary => "unary_unary",
            Self::UnaryStream => "unary_stream",
            Self::StreamUnary => "stream_unary",
            Self::StreamStream => "stream_stream",
        }
    }

    pub const fn streams_request(self) -> bool {
        matches!(self, Self::StreamUnary | Self::StreamStream)
    }

    pub const fn streams_response(self) -> bool {
        matches!(self, Self::UnaryStream | Self::StreamStream)
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Method paths and their shapes.
pub const METHODS: &[(&str, CallShape)] = &[
    ("/echo.Echo/Square", CallShape::UnaryUnary),
    ("/echo.Echo/RangeSquare", CallShape::UnaryStream),
    ("/echo.Echo/SumSquare", CallShape::StreamUnary),
    ("/echo.Echo/StreamrangeSquare", CallShape::StreamStream),
    ("/grpc.health.v1.Health/Check", CallShape::UnaryUnary),
    ("/grpc.health.v1.Health/Watch", CallShape::UnaryStream),
    (
        "/grpc.reflection.v1.ServerReflection/ServerReflectionInfo",
        CallShape::StreamStream,
    ),
    (
        "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo",
        CallShape::StreamStream,
    ),
];

/// Looks up the shape registered for `path`.
pub fn shape_of(path: &str) -> Option<CallShape> {
    METHODS
        .iter()
        .find(|(method, _)| *method == path)
        .map(|(_, shape)| *shape)
}
